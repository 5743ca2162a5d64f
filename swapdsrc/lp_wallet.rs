//! Registry of the currencies this node is configured to market-make.
//!
//! Populated once from the configuration at startup and read-only afterwards,
//! so admission checks never need a lock.

use std::collections::HashMap;

/// Per-currency market making parameters.
///
/// The RPC fields are carried for connector construction; the exchange core
/// itself only reads the trading bounds and the chain timing parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WalletParams {
    pub currency: String,
    #[serde(default)]
    pub rpc_endpoint: String,
    #[serde(default)]
    pub rpc_user: String,
    #[serde(default)]
    pub rpc_password: String,
    /// Smallest accepted order amount, in satoshis.
    pub min_amount: u64,
    /// Largest accepted order amount, in satoshis.
    pub max_amount: u64,
    pub fee_per_byte: u64,
    pub min_tx_fee: u64,
    pub required_confirmations: u32,
    /// Average block time of the chain, used to express timelocks in blocks.
    pub block_time_seconds: u64,
    #[serde(default)]
    pub address_prefix: String,
}

#[derive(Debug, Default)]
pub struct WalletRegistry {
    wallets: HashMap<String, WalletParams>,
}

impl WalletRegistry {
    pub fn new(params: Vec<WalletParams>) -> WalletRegistry {
        let mut wallets = HashMap::with_capacity(params.len());
        for mut p in params {
            if p.block_time_seconds == 0 {
                log::warn!("wallet {}: block_time_seconds is 0, defaulting to 1", p.currency);
                p.block_time_seconds = 1;
            }
            if wallets.insert(p.currency.clone(), p).is_some() {
                log::warn!("duplicate wallet entry in configuration, keeping the last one");
            }
        }
        WalletRegistry { wallets }
    }

    /// True when at least one wallet is configured, i.e. the node can act as
    /// an exchange at all.
    pub fn is_enabled(&self) -> bool { !self.wallets.is_empty() }

    pub fn has(&self, currency: &str) -> bool { self.wallets.contains_key(currency) }

    pub fn params(&self, currency: &str) -> Option<&WalletParams> { self.wallets.get(currency) }

    pub fn enabled_currencies(&self) -> Vec<String> {
        let mut currencies: Vec<String> = self.wallets.keys().cloned().collect();
        currencies.sort();
        currencies
    }
}
