//! Pending order book and counter-order matching.
//!
//! Orders here are half-swaps waiting for their mirror image. Matching is
//! exact on amounts and currencies; among several candidates the oldest one
//! wins (FIFO), and equal timestamps break by ascending order id so that
//! every node resolves a tie the same way.

use ethereum_types::H256;
use itertools::Itertools;
use std::collections::HashMap;

use crate::lp_network::PeerAddr;
use crate::ui_events::PendingOrderDescr;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Order {
    pub id: H256,
    pub source_address: PeerAddr,
    pub source_currency: String,
    pub source_amount: u64,
    pub dest_address: PeerAddr,
    pub dest_currency: String,
    pub dest_amount: u64,
    pub created_at: u64,
    /// Absolute expiry, ms since epoch.
    pub timeout: u64,
}

impl Order {
    pub fn is_expired(&self, now: u64) -> bool { now >= self.timeout }

    /// True when this order is the exact mirror of the given terms: it
    /// offers what the terms ask for and asks for what the terms offer.
    pub fn mirrors(
        &self,
        source_currency: &str,
        source_amount: u64,
        dest_currency: &str,
        dest_amount: u64,
    ) -> bool {
        self.source_currency == dest_currency
            && self.dest_currency == source_currency
            && self.source_amount == dest_amount
            && self.dest_amount == source_amount
    }

    pub fn descr(&self) -> PendingOrderDescr {
        PendingOrderDescr {
            id: self.id,
            source_currency: self.source_currency.clone(),
            source_amount: self.source_amount,
            dest_currency: self.dest_currency.clone(),
            dest_amount: self.dest_amount,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderBook {
    orders: HashMap<H256, Order>,
    last_stamp: u64,
}

impl OrderBook {
    pub fn new() -> OrderBook { OrderBook::default() }

    pub fn len(&self) -> usize { self.orders.len() }

    pub fn is_empty(&self) -> bool { self.orders.is_empty() }

    pub fn contains(&self, id: &H256) -> bool { self.orders.contains_key(id) }

    pub fn get(&self, id: &H256) -> Option<&Order> { self.orders.get(id) }

    pub fn insert(&mut self, order: Order) { self.orders.insert(order.id, order); }

    pub fn remove(&mut self, id: &H256) -> Option<Order> { self.orders.remove(id) }

    /// Creation stamps are forced monotonic within one book so that FIFO
    /// matching is well defined even when the wall clock stalls.
    pub fn bump_stamp(&mut self, now: u64) -> u64 {
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    /// The oldest order mirroring the given terms, if any.
    pub fn find_match(
        &self,
        source_currency: &str,
        source_amount: u64,
        dest_currency: &str,
        dest_amount: u64,
    ) -> Option<H256> {
        self.orders
            .values()
            .filter(|order| order.mirrors(source_currency, source_amount, dest_currency, dest_amount))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|order| order.id)
    }

    /// Removes and returns the match chosen by [`OrderBook::find_match`].
    pub fn take_match(
        &mut self,
        source_currency: &str,
        source_amount: u64,
        dest_currency: &str,
        dest_amount: u64,
    ) -> Option<Order> {
        let id = self.find_match(source_currency, source_amount, dest_currency, dest_amount)?;
        self.orders.remove(&id)
    }

    pub fn drain_expired(&mut self, now: u64) -> Vec<Order> {
        let expired: Vec<H256> = self
            .orders
            .values()
            .filter(|order| order.is_expired(now))
            .map(|order| order.id)
            .collect();
        expired.into_iter().filter_map(|id| self.orders.remove(&id)).collect()
    }

    /// Point-in-time copy, oldest first.
    pub fn snapshot(&self) -> Vec<Order> {
        self.orders
            .values()
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .collect()
    }
}

#[cfg(test)]
#[path = "ordermatch_tests.rs"]
mod ordermatch_tests;
