//! Swap lifecycle: states, cancel reasons and the timelock policy.
//!
//! # Timelock policy
//!
//! Both parties lock funds into an HTLC keyed by the hash of a secret the
//! maker generates. The maker redeems the taker's HTLC by revealing the
//! secret on the taker's chain; the taker then redeems the maker's HTLC
//! with the observed secret. The maker therefore commits with the *longer*
//! refund timelock: even if the secret shows up on the taker's chain at the
//! last moment, the maker still has time to claim on its own chain.
//!
//! Maker locktime is ~2 hours, taker locktime ~1 hour, each expressed in
//! blocks of the respective chain.

use derive_more::Display;

#[path = "lp_swap/transaction.rs"]
mod transaction;

pub use transaction::{FundingData, InitData, Side, TradeParty, Transaction, UpdateOutcome};

/// Maker refund timelock in seconds.
pub const MAKER_PAYMENT_LOCKTIME: u64 = 7200;
/// Taker refund timelock in seconds.
pub const TAKER_PAYMENT_LOCKTIME: u64 = 3600;

/// Lifecycle states of a matched swap.
///
/// The numeric codes are part of the UI contract and must remain stable
/// across releases. `JoinCreated` and `Signed` are reserved codes kept for
/// compatibility with older wire peers; the engine never targets them.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TransactionState {
    New = 0,
    JoinCreated = 1,
    Hold = 2,
    Initialized = 3,
    Created = 4,
    Signed = 5,
    Committed = 6,
    Finished = 7,
    Cancelled = 8,
    Dropped = 9,
}

impl TransactionState {
    pub fn code(self) -> u32 { self as u32 }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Finished | TransactionState::Cancelled | TransactionState::Dropped
        )
    }
}

/// Why a swap was cancelled or dropped. Codes are stable, like state codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequest = 0,
    Expired = 1,
    TimelockExpired = 2,
    ProtocolViolation = 3,
    ConnectorFailure = 4,
    PeerCancelled = 5,
}

impl CancelReason {
    pub fn code(self) -> u32 { self as u32 }
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum SwapStateError {
    #[display(fmt = "swap is already terminal in state {:?}", _0)]
    TerminalState(TransactionState),
    #[display(fmt = "message sender is not a party of the swap")]
    UnknownParty,
    #[display(fmt = "party re-announced {} with different data", fact)]
    ConflictingFact { fact: &'static str },
}

/// Absolute block height after which a payment can be refunded.
///
/// The seconds budget is rounded *up* to whole blocks so a fast chain never
/// shortens the budget.
pub fn payment_locktime(current_height: u64, locktime_secs: u64, block_time_seconds: u64) -> u64 {
    let block_time = block_time_seconds.max(1);
    current_height + (locktime_secs + block_time - 1) / block_time
}

#[cfg(test)]
mod lp_swap_tests {
    use super::*;

    #[test]
    fn test_state_codes_are_stable() {
        assert_eq!(TransactionState::New.code(), 0);
        assert_eq!(TransactionState::JoinCreated.code(), 1);
        assert_eq!(TransactionState::Hold.code(), 2);
        assert_eq!(TransactionState::Initialized.code(), 3);
        assert_eq!(TransactionState::Created.code(), 4);
        assert_eq!(TransactionState::Signed.code(), 5);
        assert_eq!(TransactionState::Committed.code(), 6);
        assert_eq!(TransactionState::Finished.code(), 7);
        assert_eq!(TransactionState::Cancelled.code(), 8);
        assert_eq!(TransactionState::Dropped.code(), 9);
    }

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(CancelReason::UserRequest.code(), 0);
        assert_eq!(CancelReason::Expired.code(), 1);
        assert_eq!(CancelReason::TimelockExpired.code(), 2);
        assert_eq!(CancelReason::ProtocolViolation.code(), 3);
        assert_eq!(CancelReason::ConnectorFailure.code(), 4);
        assert_eq!(CancelReason::PeerCancelled.code(), 5);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Finished.is_terminal());
        assert!(TransactionState::Cancelled.is_terminal());
        assert!(TransactionState::Dropped.is_terminal());
        assert!(!TransactionState::New.is_terminal());
        assert!(!TransactionState::Committed.is_terminal());
    }

    #[test]
    fn test_payment_locktime_rounds_up() {
        // 3600s on a 600s chain: exactly 6 blocks.
        assert_eq!(payment_locktime(100, 3600, 600), 106);
        // 3600s on a 7s chain: 515 blocks would be 3605s, 514 too short.
        assert_eq!(payment_locktime(0, 3600, 7), 515);
        // Degenerate block time is clamped.
        assert_eq!(payment_locktime(10, 60, 0), 70);
    }

    #[test]
    fn test_maker_always_has_more_wall_clock_time() {
        // Across wildly different block times the maker's refund deadline
        // stays strictly later in wall-clock terms than the taker's.
        let block_times = [1u64, 7, 15, 60, 150, 600];
        for &maker_bt in &block_times {
            for &taker_bt in &block_times {
                let maker_lock = payment_locktime(1000, MAKER_PAYMENT_LOCKTIME, maker_bt);
                let taker_lock = payment_locktime(500, TAKER_PAYMENT_LOCKTIME, taker_bt);
                let maker_wall = (maker_lock - 1000) * maker_bt;
                let taker_wall = (taker_lock - 500) * taker_bt;
                assert!(
                    maker_wall > taker_wall,
                    "maker {}s <= taker {}s (block times {}/{})",
                    maker_wall,
                    taker_wall,
                    maker_bt,
                    taker_bt
                );
            }
        }
    }
}
