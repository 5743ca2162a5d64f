//! Wallet connector capability interface.
//!
//! Each market-made currency is backed by a connector: an opaque client of
//! the corresponding blockchain daemon. The exchange core never inspects
//! connector internals; it only polices confirmation depth and timelocks
//! through this trait.

use derive_more::Display;
use rand::{thread_rng, Rng};
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum ConnectorError {
    #[display(fmt = "transport error: {}", _0)]
    Transport(String),
    #[display(fmt = "transaction {} rejected: {}", txid, reason)]
    TxRejected { txid: String, reason: String },
}

/// Blocking chain client used by the exchange.
///
/// Implementations talk JSON-RPC to the per-currency daemon; none of that
/// plumbing leaks through this boundary. Calls may be slow, so they must
/// never be made while an exchange table lock is held.
pub trait WalletConnector: Send + Sync {
    fn list_unspent(&self, excluded: &HashSet<Utxo>) -> Result<Vec<Utxo>, ConnectorError>;

    /// Broadcasts a raw transaction, returning its txid.
    fn broadcast_raw_tx(&self, tx_hex: &str) -> Result<String, ConnectorError>;

    /// Block height the transaction was mined at, `None` while unconfirmed
    /// or unknown.
    fn fetch_tx_block(&self, txid: &str) -> Result<Option<u64>, ConnectorError>;

    fn current_block_height(&self) -> Result<u64, ConnectorError>;
}

/// Confirmation depth of a transaction.
///
/// The height difference is computed as a signed value: a tip lagging behind
/// the recorded tx block (stale or reorged node) counts as zero
/// confirmations instead of wrapping.
pub fn confirmations(connector: &dyn WalletConnector, txid: &str) -> Result<u64, ConnectorError> {
    let tx_block = match connector.fetch_tx_block(txid)? {
        Some(block) => block,
        None => return Ok(0),
    };
    let tip = connector.current_block_height()?;
    let depth = tip as i64 - tx_block as i64;
    if depth < 0 {
        return Ok(0);
    }
    Ok(depth as u64 + 1)
}

/// Retry budget for transient connector failures.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Runs `op` until it succeeds or the retry budget is exhausted, sleeping
/// with exponential backoff and jitter in between.
pub fn with_retries<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, ConnectorError>
where
    F: FnMut() -> Result<T, ConnectorError>,
{
    let mut delay = policy.base_delay_ms;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.attempts.max(1) {
                    return Err(err);
                }
                let jitter = thread_rng().gen_range(0, delay.max(1));
                log::warn!(
                    "connector call failed ({}), retry {}/{} in {}ms",
                    err,
                    attempt,
                    policy.attempts,
                    delay + jitter
                );
                thread::sleep(Duration::from_millis(delay + jitter));
                delay = delay.saturating_mul(2).min(policy.max_delay_ms);
            },
        }
    }
}

#[cfg(test)]
pub mod for_tests {
    //! A scriptable in-memory connector for lifecycle and sweeper tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct MockConnector {
        pub height: AtomicU64,
        pub tx_blocks: Mutex<HashMap<String, u64>>,
        pub unspent: Mutex<Vec<Utxo>>,
    }

    impl MockConnector {
        pub fn with_height(height: u64) -> MockConnector {
            let connector = MockConnector::default();
            connector.height.store(height, Ordering::SeqCst);
            connector
        }

        pub fn set_height(&self, height: u64) { self.height.store(height, Ordering::SeqCst); }

        pub fn confirm_tx(&self, txid: &str, block: u64) {
            self.tx_blocks.lock().insert(txid.to_owned(), block);
        }
    }

    impl WalletConnector for MockConnector {
        fn list_unspent(&self, excluded: &HashSet<Utxo>) -> Result<Vec<Utxo>, ConnectorError> {
            Ok(self
                .unspent
                .lock()
                .iter()
                .filter(|utxo| !excluded.contains(utxo))
                .cloned()
                .collect())
        }

        fn broadcast_raw_tx(&self, tx_hex: &str) -> Result<String, ConnectorError> {
            Ok(format!("{:08x}", crc::crc32::checksum_ieee(tx_hex.as_bytes())))
        }

        fn fetch_tx_block(&self, txid: &str) -> Result<Option<u64>, ConnectorError> {
            Ok(self.tx_blocks.lock().get(txid).copied())
        }

        fn current_block_height(&self) -> Result<u64, ConnectorError> {
            Ok(self.height.load(Ordering::SeqCst))
        }
    }
}
