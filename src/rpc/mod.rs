//! External chain backends
//!
//! This module handles:
//! - The traits the pipeline talks to the chain through (broadcast, UTXOs, asset balances)
//! - Shared HTTP client configuration
//! - Esplora and Metashrew implementations of those traits

pub mod esplora;
pub mod metashrew;

use async_trait::async_trait;
use bitcoin::{Address, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnowballError};
use crate::types::{ContractId, Utxo};

pub use esplora::EsploraClient;
pub use metashrew::MetashrewClient;

/// RPC client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Esplora REST base URL
    pub esplora_url: String,
    /// Metashrew JSON-RPC URL
    pub metashrew_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for transient failures
    pub max_retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum concurrent requests per client
    pub max_concurrent_requests: usize,
    /// Whether the node accepts children of unconfirmed parents
    pub supports_unconfirmed_chaining: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            esplora_url: "http://localhost:3000".to_string(),
            metashrew_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_concurrent_requests: 10,
            supports_unconfirmed_chaining: true,
        }
    }
}

/// Where a transaction currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Unknown,
    InMempool,
    Confirmed { block_height: u64 },
}

impl ConfirmationStatus {
    pub fn is_visible(&self) -> bool {
        !matches!(self, ConfirmationStatus::Unknown)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationStatus::Confirmed { .. })
    }
}

/// Submits transactions and reports their status
#[async_trait]
pub trait BroadcastBackend: Send + Sync {
    /// Submit a signed transaction, returning the txid the node accepted
    async fn submit(&self, signed_hex: &str) -> Result<Txid>;

    /// Whether `txid` is currently in the mempool
    async fn query_mempool(&self, txid: &Txid) -> Result<bool>;

    async fn query_confirmation(&self, txid: &Txid) -> Result<ConfirmationStatus>;

    /// Whether children of unconfirmed parents are relayed
    fn supports_unconfirmed_chaining(&self) -> bool;

    /// Visible in the mempool or in a block
    async fn is_visible(&self, txid: &Txid) -> Result<bool> {
        if self.query_mempool(txid).await? {
            return Ok(true);
        }
        Ok(self.query_confirmation(txid).await?.is_visible())
    }
}

/// Lists spendable outputs of an address
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_spendable(&self, address: &Address) -> Result<Vec<Utxo>>;
}

/// Reads protocol asset balances
#[async_trait]
pub trait AssetQuery: Send + Sync {
    async fn balance_of(&self, address: &Address, contract_id: ContractId) -> Result<u128>;
}

/// Failures worth retrying inside an HTTP client
pub(crate) fn is_transient(err: &SnowballError) -> bool {
    match err {
        SnowballError::Network(_) | SnowballError::Timeout(_) => true,
        SnowballError::Broadcast(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("status: 5") || msg.contains("too many requests")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&SnowballError::Network("connection reset".into())));
        assert!(is_transient(&SnowballError::Timeout("timed out".into())));
        assert!(is_transient(&SnowballError::Broadcast("request failed with status: 503".into())));
        assert!(!is_transient(&SnowballError::Broadcast("bad-txns-inputs-missingorspent".into())));
        assert!(!is_transient(&SnowballError::Validation("bad".into())));
    }

    #[test]
    fn test_confirmation_status() {
        assert!(!ConfirmationStatus::Unknown.is_visible());
        assert!(ConfirmationStatus::InMempool.is_visible());
        assert!(!ConfirmationStatus::InMempool.is_confirmed());
        assert!(ConfirmationStatus::Confirmed { block_height: 10 }.is_confirmed());
    }
}
