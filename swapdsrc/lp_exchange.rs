//! The exchange service: order admission, matching, and the message-driven
//! lifecycle of active swaps.
//!
//! One instance runs per market-maker node, owned by the application root
//! and shared with the transport workers and the sweeper behind an `Arc`.
//! Every logical collection is guarded by its own mutex; the global lock
//! order is
//!
//! `known_messages -> known_swap_ids -> pending -> transactions -> history -> quarantine`
//!
//! and every code path acquires locks in that order. Critical sections
//! never reach into connector RPC or the transport: outgoing messages and
//! UI notifications are accumulated into an [`Effects`] value under the
//! lock and flushed after release, and chain tips are fetched before the
//! relevant lock is taken.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use derive_more::Display;
use ethereum_types::H256;
use gstuff::now_ms;
use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::coins::{self, ConnectorError, RetryPolicy, WalletConnector};
use crate::lp_network::{ExchangeMessage, KnownSet, MessageQueue, OutgoingMessage, PeerAddr};
use crate::lp_ordermatch::{Order, OrderBook};
use crate::lp_swap::{
    payment_locktime, CancelReason, FundingData, InitData, Side, SwapStateError, TradeParty,
    Transaction, TransactionState, UpdateOutcome, MAKER_PAYMENT_LOCKTIME, TAKER_PAYMENT_LOCKTIME,
};
use crate::lp_wallet::{WalletParams, WalletRegistry};
use crate::ui_events::{UiBroadcaster, UiConnector, UiEvent};

/// How many messages one unknown swap id may keep in quarantine.
const QUARANTINE_PER_ID_LIMIT: usize = 16;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExchangeConf {
    pub wallets: Vec<WalletParams>,
    #[serde(default = "default_known_messages_capacity")]
    pub known_messages_capacity: usize,
    #[serde(default = "default_known_ids_capacity")]
    pub known_ids_capacity: usize,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_quarantine_ttl_ms")]
    pub quarantine_ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_known_messages_capacity() -> usize { 10_000 }
fn default_known_ids_capacity() -> usize { 10_000 }
fn default_history_capacity() -> usize { 1_000 }
fn default_quarantine_ttl_ms() -> u64 { 30_000 }
fn default_sweep_interval_ms() -> u64 { 1_000 }

impl ExchangeConf {
    pub fn from_json_str(conf: &str) -> Result<ExchangeConf, serde_json::Error> {
        serde_json::from_str(conf)
    }
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum ExchangeError {
    #[display(fmt = "duplicate swap id {}", _0)]
    DuplicateId(H256),
    #[display(fmt = "currency {} is not enabled on this node", _0)]
    UnsupportedCurrency(String),
    #[display(fmt = "amount {} is out of the configured bounds for {}", amount, currency)]
    InvalidAmount { currency: String, amount: u64 },
    #[display(fmt = "no matching pending order for {}", _0)]
    NoMatchingOrder(H256),
    #[display(fmt = "{} is not in the pending book", _0)]
    NotPending(H256),
    #[display(fmt = "protocol violation on swap {}: {}", id, reason)]
    ProtocolViolation { id: H256, reason: String },
    #[display(fmt = "connector failure on {}: {}", currency, error)]
    Connector { currency: String, error: ConnectorError },
}

/// One half-swap as submitted by a client or announced by a peer.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderRequest {
    pub id: H256,
    pub source_address: PeerAddr,
    pub source_currency: String,
    pub source_amount: u64,
    pub dest_address: PeerAddr,
    pub dest_currency: String,
    pub dest_amount: u64,
    /// Absolute expiry for the pending order, ms since epoch. Ignored by
    /// `accept`, which consumes an existing order instead of parking one.
    pub timeout: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CreateResult {
    pub pending_id: H256,
    pub created: bool,
}

/// Rolling window of terminated swaps.
#[derive(Debug)]
struct HistoryStore {
    capacity: usize,
    entries: HashMap<H256, Transaction>,
    order: VecDeque<H256>,
}

impl HistoryStore {
    fn new(capacity: usize) -> HistoryStore {
        HistoryStore {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &H256) -> bool { self.entries.contains_key(id) }

    fn get(&self, id: &H256) -> Option<&Transaction> { self.entries.get(id) }

    /// Idempotent: re-inserting a settled swap changes nothing.
    fn insert(&mut self, tx: Transaction) {
        if self.entries.contains_key(&tx.id) {
            return;
        }
        self.order.push_back(tx.id);
        self.entries.insert(tx.id, tx);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                log::debug!("history: evicted {}", oldest);
            }
        }
    }

    /// Oldest first.
    fn snapshot(&self) -> Vec<Transaction> {
        self.order.iter().filter_map(|id| self.entries.get(id)).cloned().collect()
    }
}

/// Side effects accumulated while a table lock is held and flushed after
/// release, so no I/O ever happens inside a critical section.
#[derive(Default)]
struct Effects {
    messages: Vec<OutgoingMessage>,
    events: Vec<UiEvent>,
}

impl Effects {
    fn msg(&mut self, to: PeerAddr, msg: ExchangeMessage) {
        self.messages.push(OutgoingMessage { to, msg });
    }

    fn ui(&mut self, event: UiEvent) { self.events.push(event); }
}

/// Whether an inbound envelope may be counted as seen.
enum Disposition {
    /// Fully processed (or intentionally ignored); replays are suppressed.
    Handled,
    /// Could not be applied yet; the transport's redelivery must get
    /// another chance, so the envelope is not recorded.
    Deferred,
}

struct QuarantinedMessage {
    msg: ExchangeMessage,
    received_at: u64,
}

pub struct Exchange {
    wallets: WalletRegistry,
    connectors: HashMap<String, Arc<dyn WalletConnector>>,
    retry: RetryPolicy,
    quarantine_ttl_ms: u64,
    sweep_interval_ms: u64,
    known_messages: Mutex<KnownSet>,
    known_swap_ids: Mutex<KnownSet>,
    pending: Mutex<OrderBook>,
    transactions: Mutex<HashMap<H256, Transaction>>,
    history: Mutex<HistoryStore>,
    quarantine: Mutex<HashMap<H256, Vec<QuarantinedMessage>>>,
    outgoing: MessageQueue,
    ui: UiBroadcaster,
    stopped: AtomicBool,
}

impl Exchange {
    pub fn new(
        conf: ExchangeConf,
        connectors: HashMap<String, Arc<dyn WalletConnector>>,
    ) -> (Arc<Exchange>, Receiver<OutgoingMessage>) {
        let (outgoing, outgoing_rx) = MessageQueue::new();
        let exchange = Exchange {
            wallets: WalletRegistry::new(conf.wallets),
            connectors,
            retry: conf.retry,
            quarantine_ttl_ms: conf.quarantine_ttl_ms,
            sweep_interval_ms: conf.sweep_interval_ms,
            known_messages: Mutex::new(KnownSet::new(conf.known_messages_capacity)),
            known_swap_ids: Mutex::new(KnownSet::new(conf.known_ids_capacity)),
            pending: Mutex::new(OrderBook::new()),
            transactions: Mutex::new(HashMap::new()),
            history: Mutex::new(HistoryStore::new(conf.history_capacity)),
            quarantine: Mutex::new(HashMap::new()),
            outgoing,
            ui: UiBroadcaster::new(),
            stopped: AtomicBool::new(false),
        };
        (Arc::new(exchange), outgoing_rx)
    }

    pub fn attach_ui(&self, sink: Arc<dyn UiConnector>) { self.ui.attach(sink); }

    pub fn is_enabled(&self) -> bool { self.wallets.is_enabled() }

    pub fn enabled_currencies(&self) -> Vec<String> { self.wallets.enabled_currencies() }

    pub fn wallet_params(&self, currency: &str) -> Option<WalletParams> {
        self.wallets.params(currency).cloned()
    }

    /// Admits the order and either matches it against a mirror counter-order
    /// (promoting both halves into an active swap) or parks it in the
    /// pending book.
    pub fn create_transaction(&self, req: OrderRequest) -> Result<CreateResult, ExchangeError> {
        self.validate_order(&req)?;
        if self.known_swap_ids.lock().contains(&req.id) {
            return Err(ExchangeError::DuplicateId(req.id));
        }
        // Parking an order is a purely local operation. The chain tips are
        // only needed to stamp refund deadlines at promotion, and fetching
        // them is connector RPC, which is forbidden under a lock: peek for
        // a counter-order, fetch the tips with no lock held, re-check
        // under the lock.
        let mut lock_times: Option<(u64, u64)> = None;
        loop {
            if lock_times.is_none()
                && self
                    .pending
                    .lock()
                    .find_match(
                        &req.source_currency,
                        req.source_amount,
                        &req.dest_currency,
                        req.dest_amount,
                    )
                    .is_some()
            {
                lock_times = Some(self.lock_times(&req.dest_currency, &req.source_currency)?);
            }

            let now = now_ms();
            let mut fx = Effects::default();
            let result = {
                let mut known_ids = self.known_swap_ids.lock();
                if !known_ids.insert(req.id) {
                    return Err(ExchangeError::DuplicateId(req.id));
                }
                let mut pending = self.pending.lock();
                let counter = pending.take_match(
                    &req.source_currency,
                    req.source_amount,
                    &req.dest_currency,
                    req.dest_amount,
                );
                match (counter, lock_times) {
                    (Some(counter), Some((lock_time_maker, lock_time_taker))) => {
                        let mut transactions = self.transactions.lock();
                        let tx =
                            promote(counter, &req, lock_time_maker, lock_time_taker, now, &mut fx);
                        let pending_id = tx.id;
                        transactions.insert(pending_id, tx);
                        CreateResult { pending_id, created: true }
                    },
                    (Some(counter), None) => {
                        // A counter-order slipped in between the unlocked
                        // peek and now; put everything back and go fetch
                        // the chain tips first.
                        pending.insert(counter);
                        known_ids.remove(&req.id);
                        continue;
                    },
                    (None, _) => {
                        let stamp = pending.bump_stamp(now);
                        let order = Order {
                            id: req.id,
                            source_address: req.source_address.clone(),
                            source_currency: req.source_currency.clone(),
                            source_amount: req.source_amount,
                            dest_address: req.dest_address.clone(),
                            dest_currency: req.dest_currency.clone(),
                            dest_amount: req.dest_amount,
                            created_at: stamp,
                            timeout: req.timeout,
                        };
                        fx.ui(UiEvent::PendingTransactionReceived(order.descr()));
                        fx.ui(UiEvent::AddressBookEntryReceived {
                            currency: order.source_currency.clone(),
                            name: String::new(),
                            address: order.source_address.clone(),
                        });
                        fx.msg(Vec::new(), ExchangeMessage::OrderAnnounce {
                            id: order.id,
                            source_address: order.source_address.clone(),
                            source_currency: order.source_currency.clone(),
                            source_amount: order.source_amount,
                            dest_address: order.dest_address.clone(),
                            dest_currency: order.dest_currency.clone(),
                            dest_amount: order.dest_amount,
                            timeout: order.timeout,
                        });
                        pending.insert(order);
                        CreateResult { pending_id: req.id, created: false }
                    },
                }
            };
            self.flush(fx);
            if result.created {
                self.replay_quarantined(result.pending_id);
            }
            return Ok(result);
        }
    }

    /// Accepts the pending order `req.id`. The accept terms must be the
    /// exact mirror of the pending order; anything else, including an
    /// order that was matched a moment earlier by a racing accept, is
    /// `NoMatchingOrder`. Returns the active swap id.
    pub fn accept_transaction(&self, req: OrderRequest) -> Result<H256, ExchangeError> {
        self.validate_order(&req)?;

        // Resolved against the in-memory book first: a missing or
        // mismatched order is a deterministic failure and must not depend
        // on connector reachability.
        {
            let pending = self.pending.lock();
            let mirrors = match pending.get(&req.id) {
                Some(order) => order.mirrors(
                    &req.source_currency,
                    req.source_amount,
                    &req.dest_currency,
                    req.dest_amount,
                ),
                None => return Err(ExchangeError::NoMatchingOrder(req.id)),
            };
            if !mirrors {
                return Err(ExchangeError::NoMatchingOrder(req.id));
            }
        }
        // A real match is in sight; fetch the refund deadlines with no
        // lock held.
        let (lock_time_maker, lock_time_taker) =
            self.lock_times(&req.dest_currency, &req.source_currency)?;

        let now = now_ms();
        let mut fx = Effects::default();
        let tx_id = {
            let mut pending = self.pending.lock();
            let mut transactions = self.transactions.lock();
            // Re-checked under the lock: a racing accept may have consumed
            // the order while the chain tips were being fetched.
            let mirrors = match pending.get(&req.id) {
                Some(order) => order.mirrors(
                    &req.source_currency,
                    req.source_amount,
                    &req.dest_currency,
                    req.dest_amount,
                ),
                None => return Err(ExchangeError::NoMatchingOrder(req.id)),
            };
            if !mirrors {
                return Err(ExchangeError::NoMatchingOrder(req.id));
            }
            let counter = match pending.remove(&req.id) {
                Some(order) => order,
                None => return Err(ExchangeError::NoMatchingOrder(req.id)),
            };
            let tx = promote(counter, &req, lock_time_maker, lock_time_taker, now, &mut fx);
            let tx_id = tx.id;
            transactions.insert(tx_id, tx);
            tx_id
        };
        self.flush(fx);
        self.replay_quarantined(tx_id);
        Ok(tx_id)
    }

    /// Removes an unmatched order and frees its id for reuse.
    pub fn delete_pending(&self, id: H256) -> Result<(), ExchangeError> {
        {
            let mut known_ids = self.known_swap_ids.lock();
            let mut pending = self.pending.lock();
            if pending.remove(&id).is_none() {
                return Err(ExchangeError::NotPending(id));
            }
            known_ids.remove(&id);
        }
        log::info!("pending order {} deleted", id);
        Ok(())
    }

    /// Cancels a matched swap regardless of its state and records it in the
    /// history as `Cancelled`. Idempotent for swaps that already settled.
    pub fn delete_transaction(&self, id: H256) -> Result<(), ExchangeError> {
        let now = now_ms();
        let mut fx = Effects::default();
        {
            let mut transactions = self.transactions.lock();
            let mut history = self.history.lock();
            match transactions.remove(&id) {
                Some(mut tx) => {
                    if let Err(err) = tx.cancel(now) {
                        log::warn!("swap {}: {}", id, err);
                    }
                    fx.msg(tx.maker.address.clone(), ExchangeMessage::Cancel {
                        id,
                        reason: CancelReason::UserRequest,
                    });
                    fx.msg(tx.taker.address.clone(), ExchangeMessage::Cancel {
                        id,
                        reason: CancelReason::UserRequest,
                    });
                    fx.ui(UiEvent::TransactionCancelled {
                        id,
                        state_code: tx.state().code(),
                        reason_code: CancelReason::UserRequest.code(),
                    });
                    history.insert(tx);
                },
                None => {
                    if !history.contains(&id) {
                        return Err(ExchangeError::NotPending(id));
                    }
                },
            }
        }
        self.flush(fx);
        Ok(())
    }

    /// Entry point for the transport workers. Message errors never
    /// propagate: they are logged, and a hard protocol violation settles
    /// the affected swap as `Dropped`.
    pub fn handle_message(&self, msg: ExchangeMessage) {
        let digest = msg.digest();
        if self.known_messages.lock().contains(&digest) {
            log::debug!("dropping replayed '{}' for {}", msg.kind(), msg.id());
            return;
        }
        match self.dispatch(msg) {
            Disposition::Handled => {
                self.known_messages.lock().insert(digest);
            },
            Disposition::Deferred => (),
        }
    }

    fn dispatch(&self, msg: ExchangeMessage) -> Disposition {
        let kind = msg.kind();
        match msg {
            ExchangeMessage::OrderAnnounce {
                id,
                source_address,
                source_currency,
                source_amount,
                dest_address,
                dest_currency,
                dest_amount,
                timeout,
            } => {
                let req = OrderRequest {
                    id,
                    source_address,
                    source_currency,
                    source_amount,
                    dest_address,
                    dest_currency,
                    dest_amount,
                    timeout,
                };
                if let Err(err) = self.create_transaction(req) {
                    log::warn!("order announce {} rejected: {}", id, err);
                }
                Disposition::Handled
            },
            ExchangeMessage::JoinOrderHold { id }
            | ExchangeMessage::InitRequest { id }
            | ExchangeMessage::CreateRequest { id }
            | ExchangeMessage::ConfirmRequest { id } => {
                // These are addressed to the swap parties; the exchange
                // only ever emits them.
                log::debug!("ignoring '{}' for {}", kind, id);
                Disposition::Handled
            },
            other => self.handle_swap_update(other),
        }
    }

    fn handle_swap_update(&self, msg: ExchangeMessage) -> Disposition {
        let id = msg.id();
        let kind = msg.kind();

        // Confirmation depth is policed against the chain before the fact
        // is accepted. The check needs connector RPC, so the relevant data
        // is copied out and the lock released first. A confirmation that
        // arrives before the funding is known is buffered as-is; the chain
        // is policed again by the sweeper's timelock checks.
        if let ExchangeMessage::Confirmed { from, .. } = &msg {
            let funding = {
                let transactions = self.transactions.lock();
                transactions.get(&id).and_then(|tx| {
                    let side = tx.side_of(from)?;
                    let funding = tx.funding(side)?;
                    Some((tx.party(side).currency.clone(), funding.bin_txid.clone()))
                })
            };
            if let Some((currency, bin_txid)) = funding {
                match self.verify_confirmations(&currency, &bin_txid) {
                    Ok(true) => (),
                    Ok(false) => {
                        log::info!(
                            "swap {}: funding {} is below the confirmation threshold, deferring",
                            id,
                            bin_txid
                        );
                        return Disposition::Deferred;
                    },
                    Err(err) => {
                        log::warn!("swap {}: confirmation check failed: {}", id, err);
                        self.drop_swap(id, CancelReason::ConnectorFailure);
                        return Disposition::Handled;
                    },
                }
            }
        }

        let now = now_ms();
        let mut fx = Effects::default();
        let mut violation: Option<SwapStateError> = None;
        let applied = {
            let mut transactions = self.transactions.lock();
            let mut settle = false;
            let found = match transactions.get_mut(&id) {
                Some(tx) => {
                    match apply_update(tx, &msg, now, &mut fx) {
                        Ok(()) => settle = tx.state().is_terminal(),
                        Err(err) => violation = Some(err),
                    }
                    true
                },
                None => false,
            };
            if settle {
                if let Some(tx) = transactions.remove(&id) {
                    self.history.lock().insert(tx);
                }
            }
            found
        };
        self.flush(fx);

        if let Some(err) = violation {
            log::warn!("swap {}: protocol violation: {}", id, err);
            self.drop_swap(id, CancelReason::ProtocolViolation);
            return Disposition::Handled;
        }
        if applied {
            return Disposition::Handled;
        }

        // Unknown swap. An id we have already seen means the message is a
        // straggler for a pending or settled swap: drop it and let the
        // transport's redelivery sort the rest out. A brand new id may be
        // a reordering between an accept and its first peer message, so
        // the message waits in quarantine for the swap to appear.
        if self.known_swap_ids.lock().contains(&id) {
            log::debug!("dropping '{}' for known but inactive swap {}", kind, id);
            return Disposition::Handled;
        }
        let mut quarantine = self.quarantine.lock();
        let slot = quarantine.entry(id).or_insert_with(Vec::new);
        if slot.len() >= QUARANTINE_PER_ID_LIMIT {
            log::warn!("quarantine for {} is full, dropping '{}'", id, kind);
            return Disposition::Handled;
        }
        slot.push(QuarantinedMessage { msg, received_at: now });
        Disposition::Deferred
    }

    /// One pass of the background sweeper: order expiry, timelock policing
    /// and quarantine housekeeping.
    pub fn sweep_once(&self) {
        let now = now_ms();
        let mut fx = Effects::default();

        {
            let mut known_ids = self.known_swap_ids.lock();
            let mut pending = self.pending.lock();
            for order in pending.drain_expired(now) {
                known_ids.remove(&order.id);
                log::info!("pending order {} expired", order.id);
                fx.ui(UiEvent::OrderExpired { id: order.id });
            }
        }

        // Chain tips for every currency involved in an active swap,
        // fetched with no lock held.
        let currencies: Vec<String> = {
            let transactions = self.transactions.lock();
            transactions
                .values()
                .flat_map(|tx| vec![tx.maker.currency.clone(), tx.taker.currency.clone()])
                .sorted()
                .dedup()
                .collect()
        };
        let mut heights: HashMap<String, u64> = HashMap::new();
        for currency in currencies {
            let height = self.connector(&currency).and_then(|connector| {
                coins::with_retries(&self.retry, || connector.current_block_height()).map_err(
                    |error| ExchangeError::Connector { currency: currency.clone(), error },
                )
            });
            match height {
                Ok(height) => {
                    heights.insert(currency, height);
                },
                // Skipped this round; the next sweep retries.
                Err(err) => log::warn!("sweep: {}", err),
            }
        }

        {
            let mut transactions = self.transactions.lock();
            let mut history = self.history.lock();
            let refundable: Vec<H256> = transactions
                .values()
                .filter(|tx| {
                    let maker_late = !tx.confirmed(Side::Maker)
                        && heights
                            .get(&tx.maker.currency)
                            .map_or(false, |height| *height >= tx.lock_time_maker);
                    let taker_late = !tx.confirmed(Side::Taker)
                        && heights
                            .get(&tx.taker.currency)
                            .map_or(false, |height| *height >= tx.lock_time_taker);
                    maker_late || taker_late
                })
                .map(|tx| tx.id)
                .collect();
            for id in refundable {
                if let Some(mut tx) = transactions.remove(&id) {
                    log::info!("swap {}: timelock elapsed without confirmation, engaging refund", id);
                    if let Err(err) = tx.cancel(now) {
                        log::warn!("swap {}: {}", id, err);
                    }
                    fx.msg(tx.maker.address.clone(), ExchangeMessage::Cancel {
                        id,
                        reason: CancelReason::TimelockExpired,
                    });
                    fx.msg(tx.taker.address.clone(), ExchangeMessage::Cancel {
                        id,
                        reason: CancelReason::TimelockExpired,
                    });
                    fx.ui(UiEvent::TransactionCancelled {
                        id,
                        state_code: tx.state().code(),
                        reason_code: CancelReason::TimelockExpired.code(),
                    });
                    history.insert(tx);
                }
            }
        }

        {
            let mut quarantine = self.quarantine.lock();
            let ttl = self.quarantine_ttl_ms;
            quarantine.retain(|id, items| {
                items.retain(|item| now.saturating_sub(item.received_at) < ttl);
                if items.is_empty() {
                    log::debug!("quarantine for {} expired", id);
                    return false;
                }
                true
            });
        }

        self.flush(fx);
    }

    /// Spawns the periodic sweeper. Runs until [`Exchange::stop`].
    pub fn start_sweeper(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let exchange = self.clone();
        thread::Builder::new().name("exchange_sweeper".into()).spawn(move || {
            while !exchange.stopped.load(Ordering::Relaxed) {
                exchange.sweep_once();
                thread::sleep(Duration::from_millis(exchange.sweep_interval_ms));
            }
        })
    }

    /// Spawns `count` workers draining the transport queue.
    pub fn spawn_workers(
        self: &Arc<Self>,
        incoming: Receiver<ExchangeMessage>,
        count: usize,
    ) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(count.max(1));
        for i in 0..count.max(1) {
            let exchange = self.clone();
            let incoming = incoming.clone();
            let handle = thread::Builder::new()
                .name(format!("exchange_worker_{}", i))
                .spawn(move || loop {
                    match incoming.recv_timeout(Duration::from_millis(250)) {
                        Ok(msg) => exchange.handle_message(msg),
                        Err(RecvTimeoutError::Timeout) => {
                            if exchange.stopped.load(Ordering::Relaxed) {
                                break;
                            }
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    pub fn stop(&self) { self.stopped.store(true, Ordering::Relaxed); }

    /// Active-then-history lookup.
    pub fn transaction(&self, id: &H256) -> Option<Transaction> {
        if let Some(tx) = self.transactions.lock().get(id) {
            return Some(tx.clone());
        }
        self.history.lock().get(id).cloned()
    }

    pub fn pending_transaction(&self, id: &H256) -> Option<Order> {
        self.pending.lock().get(id).cloned()
    }

    pub fn pending_transactions(&self) -> Vec<Order> { self.pending.lock().snapshot() }

    /// Snapshot of the active swaps, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions
            .lock()
            .values()
            .cloned()
            .sorted_by_key(|tx| (tx.created_at, tx.id))
            .collect()
    }

    pub fn finished_transactions(&self) -> Vec<Transaction> {
        self.history
            .lock()
            .snapshot()
            .into_iter()
            .filter(|tx| tx.state() == TransactionState::Finished)
            .collect()
    }

    pub fn transactions_history(&self) -> Vec<Transaction> { self.history.lock().snapshot() }

    /// Moves a terminal active swap into the history. Normally invoked
    /// automatically on the terminal transition; safe to call again.
    pub fn add_to_history(&self, id: H256) {
        let mut transactions = self.transactions.lock();
        let mut history = self.history.lock();
        if history.contains(&id) {
            return;
        }
        let terminal = transactions.get(&id).map_or(false, |tx| tx.state().is_terminal());
        if terminal {
            if let Some(tx) = transactions.remove(&id) {
                history.insert(tx);
            }
        }
    }

    fn validate_order(&self, req: &OrderRequest) -> Result<(), ExchangeError> {
        if req.source_currency == req.dest_currency {
            return Err(ExchangeError::ProtocolViolation {
                id: req.id,
                reason: "source and destination currency are the same".into(),
            });
        }
        self.check_amount(&req.source_currency, req.source_amount)?;
        self.check_amount(&req.dest_currency, req.dest_amount)?;
        Ok(())
    }

    fn check_amount(&self, currency: &str, amount: u64) -> Result<(), ExchangeError> {
        let params = self
            .wallets
            .params(currency)
            .ok_or_else(|| ExchangeError::UnsupportedCurrency(currency.to_owned()))?;
        if amount == 0 || amount < params.min_amount || amount > params.max_amount {
            return Err(ExchangeError::InvalidAmount { currency: currency.to_owned(), amount });
        }
        Ok(())
    }

    /// Refund deadlines for a swap about to be promoted, derived from the
    /// current tips of both chains.
    fn lock_times(
        &self,
        maker_currency: &str,
        taker_currency: &str,
    ) -> Result<(u64, u64), ExchangeError> {
        let maker_block_time = self
            .wallets
            .params(maker_currency)
            .map(|p| p.block_time_seconds)
            .ok_or_else(|| ExchangeError::UnsupportedCurrency(maker_currency.to_owned()))?;
        let taker_block_time = self
            .wallets
            .params(taker_currency)
            .map(|p| p.block_time_seconds)
            .ok_or_else(|| ExchangeError::UnsupportedCurrency(taker_currency.to_owned()))?;
        let maker_height = self.chain_height(maker_currency)?;
        let taker_height = self.chain_height(taker_currency)?;
        Ok((
            payment_locktime(maker_height, MAKER_PAYMENT_LOCKTIME, maker_block_time),
            payment_locktime(taker_height, TAKER_PAYMENT_LOCKTIME, taker_block_time),
        ))
    }

    fn chain_height(&self, currency: &str) -> Result<u64, ExchangeError> {
        let connector = self.connector(currency)?;
        coins::with_retries(&self.retry, || connector.current_block_height())
            .map_err(|error| ExchangeError::Connector { currency: currency.to_owned(), error })
    }

    fn connector(&self, currency: &str) -> Result<Arc<dyn WalletConnector>, ExchangeError> {
        self.connectors.get(currency).cloned().ok_or_else(|| ExchangeError::Connector {
            currency: currency.to_owned(),
            error: ConnectorError::Transport("no connector registered".into()),
        })
    }

    fn verify_confirmations(&self, currency: &str, txid: &str) -> Result<bool, ExchangeError> {
        let required = self
            .wallets
            .params(currency)
            .map(|p| u64::from(p.required_confirmations))
            .ok_or_else(|| ExchangeError::UnsupportedCurrency(currency.to_owned()))?;
        let connector = self.connector(currency)?;
        let depth = coins::with_retries(&self.retry, || coins::confirmations(&*connector, txid))
            .map_err(|error| ExchangeError::Connector { currency: currency.to_owned(), error })?;
        Ok(depth >= required)
    }

    /// Settles a swap as `Dropped` after a hard failure.
    fn drop_swap(&self, id: H256, reason: CancelReason) {
        let now = now_ms();
        let mut fx = Effects::default();
        {
            let mut transactions = self.transactions.lock();
            if let Some(mut tx) = transactions.remove(&id) {
                if let Err(err) = tx.mark_dropped(now) {
                    log::warn!("swap {}: {}", id, err);
                }
                fx.msg(tx.maker.address.clone(), ExchangeMessage::Cancel { id, reason });
                fx.msg(tx.taker.address.clone(), ExchangeMessage::Cancel { id, reason });
                fx.ui(UiEvent::TransactionCancelled {
                    id,
                    state_code: tx.state().code(),
                    reason_code: reason.code(),
                });
                self.history.lock().insert(tx);
            }
        }
        self.flush(fx);
    }

    fn replay_quarantined(&self, id: H256) {
        let stale = self.quarantine.lock().remove(&id);
        if let Some(stale) = stale {
            log::debug!("replaying {} quarantined message(s) for {}", stale.len(), id);
            for item in stale {
                self.handle_swap_update(item.msg);
            }
        }
    }

    fn flush(&self, fx: Effects) {
        for message in fx.messages {
            self.outgoing.send(message.to, message.msg);
        }
        self.ui.notify(&fx.events);
    }
}

/// Builds the active swap out of the matched halves and queues the
/// `JoinOrderHold` notifications. The pending counter-order becomes the
/// maker and keeps its id.
fn promote(
    counter: Order,
    req: &OrderRequest,
    lock_time_maker: u64,
    lock_time_taker: u64,
    now: u64,
    fx: &mut Effects,
) -> Transaction {
    let maker = TradeParty {
        address: counter.source_address,
        currency: counter.source_currency,
        amount: counter.source_amount,
    };
    let taker = TradeParty {
        address: req.source_address.clone(),
        currency: req.source_currency.clone(),
        amount: req.source_amount,
    };
    let tx = Transaction::new(counter.id, maker, taker, lock_time_maker, lock_time_taker, now);
    log::info!(
        "swap {} matched: {} {} <-> {} {}",
        tx.id,
        tx.maker.amount,
        tx.maker.currency,
        tx.taker.amount,
        tx.taker.currency
    );
    fx.msg(tx.maker.address.clone(), ExchangeMessage::JoinOrderHold { id: tx.id });
    fx.msg(tx.taker.address.clone(), ExchangeMessage::JoinOrderHold { id: tx.id });
    fx.ui(UiEvent::LogMessage(format!("swap {} matched", tx.id)));
    tx
}

fn resolve_side(tx: &Transaction, from: &[u8], kind: &str) -> Result<Side, SwapStateError> {
    match tx.side_of(from) {
        Some(side) => Ok(side),
        None => {
            log::warn!("swap {}: '{}' from unknown party {}", tx.id, kind, hex::encode(from));
            Err(SwapStateError::UnknownParty)
        },
    }
}

/// Applies one swap update under the transactions lock, translating state
/// transitions into queued peer requests and UI notifications.
fn apply_update(
    tx: &mut Transaction,
    msg: &ExchangeMessage,
    now: u64,
    fx: &mut Effects,
) -> Result<(), SwapStateError> {
    let outcome = match msg {
        ExchangeMessage::HoldApply { from, .. } => {
            let side = resolve_side(tx, from, msg.kind())?;
            tx.update_hold_apply(side, now)?
        },
        ExchangeMessage::Initialized { from, data_tx_id, peer_pubkey, .. } => {
            let side = resolve_side(tx, from, msg.kind())?;
            let init = InitData { data_tx_id: *data_tx_id, peer_pubkey: peer_pubkey.clone() };
            tx.update_initialized(side, init, now)?
        },
        ExchangeMessage::Created { from, bin_txid, inner_script, .. } => {
            let side = resolve_side(tx, from, msg.kind())?;
            let funding =
                FundingData { bin_txid: bin_txid.clone(), inner_script: inner_script.clone() };
            tx.update_created(side, funding, now)?
        },
        ExchangeMessage::Confirmed { from, .. } => {
            let side = resolve_side(tx, from, msg.kind())?;
            tx.update_confirmed(side, now)?
        },
        ExchangeMessage::Cancel { reason, .. } => {
            tx.cancel(now)?;
            log::info!("swap {} cancelled by peer ({:?})", tx.id, reason);
            fx.ui(UiEvent::TransactionCancelled {
                id: tx.id,
                state_code: tx.state().code(),
                reason_code: reason.code(),
            });
            return Ok(());
        },
        other => {
            log::debug!("'{}' is not a swap update", other.kind());
            return Ok(());
        },
    };
    match outcome {
        UpdateOutcome::Duplicate => {
            log::debug!("swap {}: duplicate '{}'", tx.id, msg.kind());
        },
        UpdateOutcome::Noted => (),
        UpdateOutcome::Advanced(states) => {
            for state in states {
                log::info!("swap {} -> {:?}", tx.id, state);
                fx.ui(UiEvent::TransactionStateChanged { id: tx.id, state_code: state.code() });
                let request = match state {
                    TransactionState::Hold => Some(ExchangeMessage::InitRequest { id: tx.id }),
                    TransactionState::Initialized => {
                        Some(ExchangeMessage::CreateRequest { id: tx.id })
                    },
                    TransactionState::Created => Some(ExchangeMessage::ConfirmRequest { id: tx.id }),
                    _ => None,
                };
                if let Some(request) = request {
                    fx.msg(tx.maker.address.clone(), request.clone());
                    fx.msg(tx.taker.address.clone(), request);
                }
            }
        },
    }
    Ok(())
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod exchange_tests;
