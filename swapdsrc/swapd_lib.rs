//! Cross-chain atomic swap exchange service for market maker nodes.
//!
//! # A note on the terminology used
//!
//! Maker = "A" = the party whose order was sitting in the pending book and
//! got accepted. The maker picks the swap secret and therefore commits with
//! the *longer* refund timelock.
//!
//! Taker = "B" = the party whose order (or accept request) matched the
//! maker's. The taker commits with the shorter timelock so that a secret
//! revealed on the taker's chain always leaves the maker time to claim.
//!
//! The exchange itself never builds or signs on-chain transactions. It owns
//! the pending order book, the table of active swaps and the rolling history,
//! matches counter-orders, and drives each matched swap through the
//! hold -> initialized -> created -> committed lifecycle as peer messages and
//! chain observations come in. Wallet connectors are opaque blockchain
//! clients held by capability trait only.

#[macro_use] extern crate serde_derive;

pub mod coins;
pub mod lp_exchange;
pub mod lp_network;
pub mod lp_ordermatch;
pub mod lp_swap;
pub mod lp_wallet;
pub mod ui_events;

pub use lp_exchange::{CreateResult, Exchange, ExchangeConf, ExchangeError, OrderRequest};
