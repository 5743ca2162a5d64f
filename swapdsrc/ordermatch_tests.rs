use super::*;

fn order(id: u64, src: &str, src_amount: u64, dst: &str, dst_amount: u64, created_at: u64) -> Order {
    Order {
        id: H256::from_low_u64_be(id),
        source_address: vec![id as u8],
        source_currency: src.into(),
        source_amount: src_amount,
        dest_address: vec![id as u8, 0xff],
        dest_currency: dst.into(),
        dest_amount: dst_amount,
        created_at,
        timeout: created_at + 60_000,
    }
}

#[test]
fn test_match_exact_mirror() {
    let mut book = OrderBook::new();
    book.insert(order(1, "BLOCK", 100_000_000, "LTC", 1_000_000, 10));

    // The mirror of the pending order: offers LTC, asks BLOCK.
    let actual = book.find_match("LTC", 1_000_000, "BLOCK", 100_000_000);
    assert_eq!(actual, Some(H256::from_low_u64_be(1)));

    // Same currencies, different amount: no match.
    let actual = book.find_match("LTC", 2_000_000, "BLOCK", 100_000_000);
    assert_eq!(actual, None);

    // Same direction as the pending order: no match.
    let actual = book.find_match("BLOCK", 100_000_000, "LTC", 1_000_000);
    assert_eq!(actual, None);
}

#[test]
fn test_match_prefers_oldest() {
    let mut book = OrderBook::new();
    book.insert(order(2, "BLOCK", 100, "LTC", 10, 20));
    book.insert(order(1, "BLOCK", 100, "LTC", 10, 30));
    book.insert(order(3, "BLOCK", 100, "LTC", 10, 25));

    let actual = book.find_match("LTC", 10, "BLOCK", 100);
    assert_eq!(actual, Some(H256::from_low_u64_be(2)));
}

#[test]
fn test_match_ties_break_by_id() {
    let mut book = OrderBook::new();
    book.insert(order(9, "BLOCK", 100, "LTC", 10, 20));
    book.insert(order(4, "BLOCK", 100, "LTC", 10, 20));
    book.insert(order(7, "BLOCK", 100, "LTC", 10, 20));

    let actual = book.find_match("LTC", 10, "BLOCK", 100);
    assert_eq!(actual, Some(H256::from_low_u64_be(4)));
}

#[test]
fn test_take_match_removes_the_order() {
    let mut book = OrderBook::new();
    book.insert(order(1, "BLOCK", 100, "LTC", 10, 20));

    let taken = book.take_match("LTC", 10, "BLOCK", 100).unwrap();
    assert_eq!(taken.id, H256::from_low_u64_be(1));
    assert!(book.is_empty());

    // A second taker finds nothing.
    assert!(book.take_match("LTC", 10, "BLOCK", 100).is_none());
}

#[test]
fn test_drain_expired() {
    let mut book = OrderBook::new();
    let mut fresh = order(1, "BLOCK", 100, "LTC", 10, 20);
    fresh.timeout = 1_000;
    let mut stale = order(2, "BLOCK", 200, "LTC", 20, 20);
    stale.timeout = 500;
    book.insert(fresh);
    book.insert(stale);

    let expired = book.drain_expired(600);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, H256::from_low_u64_be(2));
    assert_eq!(book.len(), 1);
    assert!(book.contains(&H256::from_low_u64_be(1)));
}

#[test]
fn test_bump_stamp_is_monotonic() {
    let mut book = OrderBook::new();
    let first = book.bump_stamp(100);
    // Wall clock stalls; stamps still advance.
    let second = book.bump_stamp(100);
    let third = book.bump_stamp(50);
    assert_eq!(first, 100);
    assert_eq!(second, 101);
    assert_eq!(third, 102);
    // Wall clock jumps ahead; stamps follow it.
    assert_eq!(book.bump_stamp(500), 500);
}

#[test]
fn test_snapshot_is_sorted() {
    let mut book = OrderBook::new();
    book.insert(order(5, "BLOCK", 100, "LTC", 10, 30));
    book.insert(order(2, "BLOCK", 100, "LTC", 10, 10));
    book.insert(order(8, "DOGE", 7, "LTC", 3, 20));

    let ids: Vec<u64> = book.snapshot().iter().map(|o| o.id.to_low_u64_be()).collect();
    assert_eq!(ids, vec![2, 8, 5]);
}
