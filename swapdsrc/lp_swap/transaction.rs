//! A matched swap and the rules that advance it.
//!
//! Every update rule is idempotent: the transport redelivers, so recording
//! the same fact twice must be a no-op after the first time. Facts arriving
//! ahead of the state they belong to are buffered and only move the state
//! once the earlier gaps close.

use ethereum_types::H256;

use super::{SwapStateError, TransactionState};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    Maker,
    Taker,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Maker => Side::Taker,
            Side::Taker => Side::Maker,
        }
    }
}

/// One half of the swap: who locks what on which chain.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TradeParty {
    pub address: Vec<u8>,
    pub currency: String,
    pub amount: u64,
}

/// Carried by the `initialized` message.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InitData {
    pub data_tx_id: H256,
    pub peer_pubkey: Vec<u8>,
}

/// On-chain HTLC funding announced by the `created` message.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FundingData {
    pub bin_txid: String,
    pub inner_script: Vec<u8>,
}

/// What applying an update did to the swap.
#[derive(Debug, PartialEq)]
pub enum UpdateOutcome {
    /// New fact recorded, state unchanged (waiting for the counterpart or
    /// for earlier gaps to close).
    Noted,
    /// The fact was already known; nothing changed.
    Duplicate,
    /// The state advanced through the listed states, in order.
    Advanced(Vec<TransactionState>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transaction {
    pub id: H256,
    pub maker: TradeParty,
    pub taker: TradeParty,
    state: TransactionState,
    maker_hold_received: bool,
    taker_hold_received: bool,
    maker_init: Option<InitData>,
    taker_init: Option<InitData>,
    maker_funding: Option<FundingData>,
    taker_funding: Option<FundingData>,
    maker_confirmed: bool,
    taker_confirmed: bool,
    /// Refund deadline on the maker's chain, absolute block height.
    pub lock_time_maker: u64,
    /// Refund deadline on the taker's chain, absolute block height.
    pub lock_time_taker: u64,
    pub created_at: u64,
    state_changed_at: u64,
}

impl Transaction {
    pub fn new(
        id: H256,
        maker: TradeParty,
        taker: TradeParty,
        lock_time_maker: u64,
        lock_time_taker: u64,
        now: u64,
    ) -> Transaction {
        Transaction {
            id,
            maker,
            taker,
            state: TransactionState::New,
            maker_hold_received: false,
            taker_hold_received: false,
            maker_init: None,
            taker_init: None,
            maker_funding: None,
            taker_funding: None,
            maker_confirmed: false,
            taker_confirmed: false,
            lock_time_maker,
            lock_time_taker,
            created_at: now,
            state_changed_at: now,
        }
    }

    pub fn state(&self) -> TransactionState { self.state }

    pub fn state_changed_at(&self) -> u64 { self.state_changed_at }

    pub fn party(&self, side: Side) -> &TradeParty {
        match side {
            Side::Maker => &self.maker,
            Side::Taker => &self.taker,
        }
    }

    /// Which side of the swap the given source address belongs to.
    pub fn side_of(&self, address: &[u8]) -> Option<Side> {
        if self.maker.address == address {
            Some(Side::Maker)
        } else if self.taker.address == address {
            Some(Side::Taker)
        } else {
            None
        }
    }

    pub fn hold_received(&self, side: Side) -> bool {
        match side {
            Side::Maker => self.maker_hold_received,
            Side::Taker => self.taker_hold_received,
        }
    }

    pub fn init(&self, side: Side) -> Option<&InitData> {
        match side {
            Side::Maker => self.maker_init.as_ref(),
            Side::Taker => self.taker_init.as_ref(),
        }
    }

    pub fn funding(&self, side: Side) -> Option<&FundingData> {
        match side {
            Side::Maker => self.maker_funding.as_ref(),
            Side::Taker => self.taker_funding.as_ref(),
        }
    }

    pub fn confirmed(&self, side: Side) -> bool {
        match side {
            Side::Maker => self.maker_confirmed,
            Side::Taker => self.taker_confirmed,
        }
    }

    pub fn update_hold_apply(&mut self, side: Side, now: u64) -> Result<UpdateOutcome, SwapStateError> {
        self.ensure_mutable()?;
        let slot = match side {
            Side::Maker => &mut self.maker_hold_received,
            Side::Taker => &mut self.taker_hold_received,
        };
        if *slot {
            return Ok(UpdateOutcome::Duplicate);
        }
        *slot = true;
        Ok(self.advance(now))
    }

    pub fn update_initialized(
        &mut self,
        side: Side,
        init: InitData,
        now: u64,
    ) -> Result<UpdateOutcome, SwapStateError> {
        self.ensure_mutable()?;
        let slot = match side {
            Side::Maker => &mut self.maker_init,
            Side::Taker => &mut self.taker_init,
        };
        if let Some(existing) = slot {
            if *existing == init {
                return Ok(UpdateOutcome::Duplicate);
            }
            return Err(SwapStateError::ConflictingFact { fact: "initialized" });
        }
        *slot = Some(init);
        Ok(self.advance(now))
    }

    pub fn update_created(
        &mut self,
        side: Side,
        funding: FundingData,
        now: u64,
    ) -> Result<UpdateOutcome, SwapStateError> {
        self.ensure_mutable()?;
        let slot = match side {
            Side::Maker => &mut self.maker_funding,
            Side::Taker => &mut self.taker_funding,
        };
        if let Some(existing) = slot {
            if *existing == funding {
                return Ok(UpdateOutcome::Duplicate);
            }
            return Err(SwapStateError::ConflictingFact { fact: "created" });
        }
        *slot = Some(funding);
        Ok(self.advance(now))
    }

    pub fn update_confirmed(&mut self, side: Side, now: u64) -> Result<UpdateOutcome, SwapStateError> {
        self.ensure_mutable()?;
        let slot = match side {
            Side::Maker => &mut self.maker_confirmed,
            Side::Taker => &mut self.taker_confirmed,
        };
        if *slot {
            return Ok(UpdateOutcome::Duplicate);
        }
        *slot = true;
        Ok(self.advance(now))
    }

    /// Moves the swap to `Cancelled`. The engaged refund path, a peer
    /// cancel or an operator delete all end here.
    pub fn cancel(&mut self, now: u64) -> Result<(), SwapStateError> {
        self.ensure_mutable()?;
        self.set_state(TransactionState::Cancelled, now);
        Ok(())
    }

    /// Moves the swap to `Dropped` after a hard failure.
    pub fn mark_dropped(&mut self, now: u64) -> Result<(), SwapStateError> {
        self.ensure_mutable()?;
        self.set_state(TransactionState::Dropped, now);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), SwapStateError> {
        if self.state.is_terminal() {
            return Err(SwapStateError::TerminalState(self.state));
        }
        Ok(())
    }

    /// Walks the state forward as far as the recorded facts allow.
    ///
    /// Facts may have been buffered ahead of time (e.g. a `confirmed` that
    /// arrived while still in `Hold`), so a single new fact can close
    /// several gaps at once. Both confirmations drive the swap through
    /// `Committed` straight to `Finished`: the confirmations are only
    /// reported once the redeem leg is visible on-chain.
    fn advance(&mut self, now: u64) -> UpdateOutcome {
        let mut passed = Vec::new();
        loop {
            let next = match self.state {
                TransactionState::New
                    if self.maker_hold_received && self.taker_hold_received =>
                {
                    TransactionState::Hold
                },
                TransactionState::Hold
                    if self.maker_init.is_some() && self.taker_init.is_some() =>
                {
                    TransactionState::Initialized
                },
                TransactionState::Initialized
                    if self.maker_funding.is_some() && self.taker_funding.is_some() =>
                {
                    TransactionState::Created
                },
                TransactionState::Created if self.maker_confirmed && self.taker_confirmed => {
                    TransactionState::Committed
                },
                TransactionState::Committed => TransactionState::Finished,
                _ => break,
            };
            self.set_state(next, now);
            passed.push(next);
        }
        if passed.is_empty() {
            UpdateOutcome::Noted
        } else {
            UpdateOutcome::Advanced(passed)
        }
    }

    fn set_state(&mut self, state: TransactionState, now: u64) {
        self.state = state;
        // Keep the change stamp monotonic even when the wall clock isn't.
        self.state_changed_at = now.max(self.state_changed_at);
    }
}

#[cfg(test)]
mod transaction_tests {
    use super::*;

    fn party(tag: u8, currency: &str, amount: u64) -> TradeParty {
        TradeParty {
            address: vec![tag; 4],
            currency: currency.into(),
            amount,
        }
    }

    fn swap() -> Transaction {
        Transaction::new(
            H256::from_low_u64_be(1),
            party(0xaa, "BLOCK", 100_000_000),
            party(0xbb, "LTC", 1_000_000),
            206,
            106,
            1_000,
        )
    }

    fn init_data(tag: u8) -> InitData {
        InitData {
            data_tx_id: H256::from_low_u64_be(tag as u64),
            peer_pubkey: vec![tag; 33],
        }
    }

    fn funding_data(tag: u8) -> FundingData {
        FundingData {
            bin_txid: format!("{:02x}", tag),
            inner_script: vec![tag, 0x51],
        }
    }

    #[test]
    fn test_happy_path() {
        let mut tx = swap();
        assert_eq!(tx.state(), TransactionState::New);

        assert_eq!(tx.update_hold_apply(Side::Maker, 1_001).unwrap(), UpdateOutcome::Noted);
        assert_eq!(tx.state(), TransactionState::New);
        assert_eq!(
            tx.update_hold_apply(Side::Taker, 1_002).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Hold])
        );

        assert_eq!(
            tx.update_initialized(Side::Taker, init_data(2), 1_003).unwrap(),
            UpdateOutcome::Noted
        );
        assert_eq!(
            tx.update_initialized(Side::Maker, init_data(1), 1_004).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Initialized])
        );

        assert_eq!(
            tx.update_created(Side::Maker, funding_data(1), 1_005).unwrap(),
            UpdateOutcome::Noted
        );
        assert_eq!(
            tx.update_created(Side::Taker, funding_data(2), 1_006).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Created])
        );

        assert_eq!(tx.update_confirmed(Side::Maker, 1_007).unwrap(), UpdateOutcome::Noted);
        assert_eq!(
            tx.update_confirmed(Side::Taker, 1_008).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Committed, TransactionState::Finished])
        );
        assert_eq!(tx.state(), TransactionState::Finished);
    }

    #[test]
    fn test_duplicate_updates_are_noops() {
        let mut tx = swap();
        tx.update_hold_apply(Side::Maker, 1_001).unwrap();
        assert_eq!(tx.update_hold_apply(Side::Maker, 1_002).unwrap(), UpdateOutcome::Duplicate);
        assert_eq!(tx.state(), TransactionState::New);

        tx.update_hold_apply(Side::Taker, 1_003).unwrap();
        // Replaying after the transition must not re-advance either.
        assert_eq!(tx.update_hold_apply(Side::Taker, 1_004).unwrap(), UpdateOutcome::Duplicate);
        assert_eq!(tx.state(), TransactionState::Hold);

        tx.update_initialized(Side::Maker, init_data(1), 1_005).unwrap();
        assert_eq!(
            tx.update_initialized(Side::Maker, init_data(1), 1_006).unwrap(),
            UpdateOutcome::Duplicate
        );
    }

    #[test]
    fn test_out_of_order_confirm_is_buffered() {
        let mut tx = swap();
        tx.update_hold_apply(Side::Maker, 1_001).unwrap();
        tx.update_hold_apply(Side::Taker, 1_002).unwrap();
        assert_eq!(tx.state(), TransactionState::Hold);

        // A confirmation while still in Hold: recorded, state untouched.
        assert_eq!(tx.update_confirmed(Side::Maker, 1_003).unwrap(), UpdateOutcome::Noted);
        assert_eq!(tx.state(), TransactionState::Hold);
        assert!(tx.confirmed(Side::Maker));

        tx.update_initialized(Side::Maker, init_data(1), 1_004).unwrap();
        tx.update_initialized(Side::Taker, init_data(2), 1_005).unwrap();
        assert_eq!(tx.state(), TransactionState::Initialized);

        tx.update_created(Side::Maker, funding_data(1), 1_006).unwrap();
        // The last funding closes the gap up to Created only; the buffered
        // maker confirmation still waits for the taker's.
        assert_eq!(
            tx.update_created(Side::Taker, funding_data(2), 1_007).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Created])
        );

        assert_eq!(
            tx.update_confirmed(Side::Taker, 1_008).unwrap(),
            UpdateOutcome::Advanced(vec![TransactionState::Committed, TransactionState::Finished])
        );
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut tx = swap();
        tx.cancel(1_001).unwrap();
        assert_eq!(tx.state(), TransactionState::Cancelled);

        let err = tx.update_hold_apply(Side::Maker, 1_002).unwrap_err();
        assert_eq!(err, SwapStateError::TerminalState(TransactionState::Cancelled));
        let err = tx.cancel(1_003).unwrap_err();
        assert_eq!(err, SwapStateError::TerminalState(TransactionState::Cancelled));
        let err = tx.mark_dropped(1_004).unwrap_err();
        assert_eq!(err, SwapStateError::TerminalState(TransactionState::Cancelled));
    }

    #[test]
    fn test_conflicting_fact_is_rejected() {
        let mut tx = swap();
        tx.update_initialized(Side::Maker, init_data(1), 1_001).unwrap();
        let err = tx.update_initialized(Side::Maker, init_data(9), 1_002).unwrap_err();
        assert_eq!(err, SwapStateError::ConflictingFact { fact: "initialized" });

        tx.update_created(Side::Taker, funding_data(2), 1_003).unwrap();
        let err = tx.update_created(Side::Taker, funding_data(7), 1_004).unwrap_err();
        assert_eq!(err, SwapStateError::ConflictingFact { fact: "created" });
    }

    #[test]
    fn test_side_of_resolves_parties() {
        let tx = swap();
        assert_eq!(tx.side_of(&[0xaa; 4]), Some(Side::Maker));
        assert_eq!(tx.side_of(&[0xbb; 4]), Some(Side::Taker));
        assert_eq!(tx.side_of(&[0xcc; 4]), None);
    }

    #[test]
    fn test_state_changed_at_is_monotonic() {
        let mut tx = swap();
        tx.update_hold_apply(Side::Maker, 2_000).unwrap();
        tx.update_hold_apply(Side::Taker, 2_000).unwrap();
        let after_hold = tx.state_changed_at();
        assert_eq!(after_hold, 2_000);

        // Wall clock going backwards must not move the stamp back.
        tx.update_initialized(Side::Maker, init_data(1), 1_500).unwrap();
        tx.update_initialized(Side::Taker, init_data(2), 1_500).unwrap();
        assert_eq!(tx.state(), TransactionState::Initialized);
        assert!(tx.state_changed_at() >= after_hold);
    }
}
