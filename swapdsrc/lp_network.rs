//! Peer protocol envelopes and the plumbing around them: envelope digests
//! for replay suppression and the outgoing message queue.
//!
//! The transport layer delivers these decoded forms with at-least-once
//! semantics and no total order; everything downstream of this module is
//! written to tolerate replays and reordering.

use blake2::{Blake2s, Digest};
use crc::crc32;
use crossbeam::channel::{unbounded, Receiver, Sender};
use ethereum_types::H256;
use std::collections::{HashSet, VecDeque};

use crate::lp_swap::CancelReason;

/// Opaque peer address, as carried inside the order halves.
pub type PeerAddr = Vec<u8>;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ExchangeMessage {
    OrderAnnounce {
        id: H256,
        source_address: PeerAddr,
        source_currency: String,
        source_amount: u64,
        dest_address: PeerAddr,
        dest_currency: String,
        dest_amount: u64,
        /// Absolute expiry of the order, ms since epoch.
        timeout: u64,
    },
    /// Sent to both parties when a counter-order match promotes the order
    /// into an active swap.
    JoinOrderHold { id: H256 },
    HoldApply { id: H256, from: PeerAddr },
    Initialized {
        id: H256,
        from: PeerAddr,
        data_tx_id: H256,
        peer_pubkey: Vec<u8>,
    },
    Created {
        id: H256,
        from: PeerAddr,
        bin_txid: String,
        inner_script: Vec<u8>,
    },
    Confirmed { id: H256, from: PeerAddr },
    InitRequest { id: H256 },
    CreateRequest { id: H256 },
    ConfirmRequest { id: H256 },
    Cancel { id: H256, reason: CancelReason },
}

impl ExchangeMessage {
    pub fn id(&self) -> H256 {
        match self {
            ExchangeMessage::OrderAnnounce { id, .. }
            | ExchangeMessage::JoinOrderHold { id }
            | ExchangeMessage::HoldApply { id, .. }
            | ExchangeMessage::Initialized { id, .. }
            | ExchangeMessage::Created { id, .. }
            | ExchangeMessage::Confirmed { id, .. }
            | ExchangeMessage::InitRequest { id }
            | ExchangeMessage::CreateRequest { id }
            | ExchangeMessage::ConfirmRequest { id }
            | ExchangeMessage::Cancel { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeMessage::OrderAnnounce { .. } => "order_announce",
            ExchangeMessage::JoinOrderHold { .. } => "join_order_hold",
            ExchangeMessage::HoldApply { .. } => "hold_apply",
            ExchangeMessage::Initialized { .. } => "initialized",
            ExchangeMessage::Created { .. } => "created",
            ExchangeMessage::Confirmed { .. } => "confirmed",
            ExchangeMessage::InitRequest { .. } => "init_request",
            ExchangeMessage::CreateRequest { .. } => "create_request",
            ExchangeMessage::ConfirmRequest { .. } => "confirm_request",
            ExchangeMessage::Cancel { .. } => "cancel",
        }
    }

    /// Digest over the full envelope: id, kind and payload.
    pub fn digest(&self) -> H256 {
        let bytes = serde_json::to_vec(self).expect("message serialization can't fail");
        blake2s256(&bytes)
    }
}

pub fn blake2s256(bytes: &[u8]) -> H256 {
    let mut hasher = Blake2s::new();
    hasher.update(bytes);
    H256::from_slice(hasher.finalize().as_slice())
}

/// A set remembering the last `capacity` inserted values.
///
/// Backs both the `known_messages` replay filter and the `known_swap_ids`
/// admission filter.
#[derive(Debug)]
pub struct KnownSet {
    capacity: usize,
    seen: HashSet<H256>,
    order: VecDeque<H256>,
}

impl KnownSet {
    pub fn new(capacity: usize) -> KnownSet {
        KnownSet {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, value: &H256) -> bool { self.seen.contains(value) }

    /// Returns true when the value was not seen before.
    pub fn insert(&mut self, value: H256) -> bool {
        if !self.seen.insert(value) {
            return false;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forgets a value early (e.g. a pending order that was deleted before
    /// it could be matched). The insertion-order queue keeps a stale slot
    /// that is skipped at eviction time.
    pub fn remove(&mut self, value: &H256) -> bool { self.seen.remove(value) }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

/// An outbound protocol message. An empty destination means "broadcast".
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub to: PeerAddr,
    pub msg: ExchangeMessage,
}

/// Queue of messages awaiting the transport.
///
/// Sending never blocks, so it is safe to enqueue while a table lock is
/// held; the transport drains the receiving end at its own pace.
pub struct MessageQueue {
    tx: Sender<OutgoingMessage>,
}

impl MessageQueue {
    pub fn new() -> (MessageQueue, Receiver<OutgoingMessage>) {
        let (tx, rx) = unbounded();
        (MessageQueue { tx }, rx)
    }

    pub fn send(&self, to: PeerAddr, msg: ExchangeMessage) {
        let payload = serde_json::to_vec(&msg).expect("message serialization can't fail");
        // Checksum here helps us visually match the logistics between the two parties' logs.
        let crc = crc32::checksum_ieee(&payload);
        log::info!("Sending '{}' ({} bytes, crc {})", msg.kind(), payload.len(), crc);
        if self.tx.send(OutgoingMessage { to, msg }).is_err() {
            log::warn!("transport queue is closed, dropping outgoing message");
        }
    }
}

#[cfg(test)]
mod lp_network_tests {
    use super::*;

    #[test]
    fn test_envelope_digest_covers_payload() {
        let a = ExchangeMessage::HoldApply {
            id: H256::from_low_u64_be(1),
            from: vec![1, 2, 3],
        };
        let b = ExchangeMessage::HoldApply {
            id: H256::from_low_u64_be(1),
            from: vec![1, 2, 4],
        };
        let c = ExchangeMessage::Confirmed {
            id: H256::from_low_u64_be(1),
            from: vec![1, 2, 3],
        };
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_known_set_replay() {
        let mut set = KnownSet::new(100);
        let h = H256::from_low_u64_be(7);
        assert!(set.insert(h));
        assert!(!set.insert(h));
        assert!(set.contains(&h));
    }

    #[test]
    fn test_known_set_evicts_oldest() {
        let mut set = KnownSet::new(3);
        for i in 0..5u64 {
            assert!(set.insert(H256::from_low_u64_be(i)));
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&H256::from_low_u64_be(0)));
        assert!(!set.contains(&H256::from_low_u64_be(1)));
        assert!(set.contains(&H256::from_low_u64_be(4)));
    }

    #[test]
    fn test_known_set_remove() {
        let mut set = KnownSet::new(10);
        let h = H256::from_low_u64_be(9);
        set.insert(h);
        assert!(set.remove(&h));
        assert!(!set.contains(&h));
        // The value can be announced again after removal.
        assert!(set.insert(h));
    }

    #[test]
    fn test_message_queue_delivers() {
        let (queue, rx) = MessageQueue::new();
        let msg = ExchangeMessage::InitRequest { id: H256::from_low_u64_be(2) };
        queue.send(vec![0xaa], msg.clone());
        let out = rx.try_recv().unwrap();
        assert_eq!(out.to, vec![0xaa]);
        assert_eq!(out.msg, msg);
    }

    #[test]
    fn test_wire_roundtrip() {
        let msg = ExchangeMessage::Created {
            id: H256::from_low_u64_be(3),
            from: vec![5, 6],
            bin_txid: "deadbeef".into(),
            inner_script: vec![0x51],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ExchangeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
