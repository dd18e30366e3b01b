//! Esplora REST client
//!
//! Implements `BroadcastBackend` and `UtxoSource` over the Esplora API with a
//! concurrency limit and a retry loop for transient failures.

use async_trait::async_trait;
use bitcoin::{Address, Txid};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use super::{is_transient, BroadcastBackend, ConfirmationStatus, RpcConfig, UtxoSource};
use crate::error::{Result, SnowballError};
use crate::types::Utxo;

/// Esplora transaction status
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    /// Transaction confirmation status
    pub confirmed: bool,
    /// Block height (if confirmed)
    pub block_height: Option<u64>,
    /// Block hash (if confirmed)
    pub block_hash: Option<String>,
    /// Block time (if confirmed)
    pub block_time: Option<u64>,
}

impl EsploraTxStatus {
    fn into_confirmation(self) -> ConfirmationStatus {
        match (self.confirmed, self.block_height) {
            (true, Some(block_height)) => ConfirmationStatus::Confirmed { block_height },
            (true, None) => ConfirmationStatus::Confirmed { block_height: 0 },
            (false, _) => ConfirmationStatus::InMempool,
        }
    }
}

/// Esplora transaction, reduced to the fields the pipeline reads
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    /// Transaction ID
    pub txid: String,
    /// Transaction fee in satoshis
    pub fee: Option<u64>,
    /// Transaction status
    pub status: EsploraTxStatus,
}

/// Esplora UTXO
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraUtxo {
    /// Transaction ID
    pub txid: String,
    /// Output index
    pub vout: u32,
    /// Output value in satoshis
    pub value: u64,
    /// Output status
    pub status: EsploraTxStatus,
}

/// Submissions are attempted once; `Broadcaster` owns the submit retry loop.
const SUBMIT_RETRIES: u32 = 0;

/// Esplora REST client
pub struct EsploraClient {
    /// HTTP client
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
    unconfirmed_chaining: bool,
    /// Rate limiter
    rate_limiter: Arc<Semaphore>,
}

impl EsploraClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SnowballError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.esplora_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            unconfirmed_chaining: config.supports_unconfirmed_chaining,
            rate_limiter: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, retries: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| SnowballError::Network(format!("rate limiter closed: {}", e)))?;

        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < retries && is_transient(&err) => {
                    attempt += 1;
                    debug!(
                        "Retrying Esplora request {} (attempt {}/{}): {}",
                        what, attempt, retries, err
                    );
                    sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// GET returning `None` on 404
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        self.with_retry(path, self.max_retries, || async move {
            debug!("Making Esplora API request to {}", path);
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(SnowballError::Network(format!(
                    "Esplora request {} failed with status: {}",
                    path, status
                )));
            }
            Ok(Some(response.json::<T>().await?))
        })
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| SnowballError::Network(format!("Esplora resource {} not found", path)))
    }

    /// Current chain tip height
    pub async fn tip_height(&self) -> Result<u64> {
        let height = self.get::<u64>("/blocks/tip/height").await?;
        debug!("Current block height: {}", height);
        Ok(height)
    }

    /// Fee estimates keyed by confirmation target in blocks
    pub async fn fee_estimates(&self) -> Result<HashMap<String, f64>> {
        self.get::<HashMap<String, f64>>("/fee-estimates").await
    }

    /// Whole sat/vB rate for a confirmation target, rounded up
    pub async fn recommended_fee_rate(&self, target_blocks: u16) -> Result<u64> {
        let estimates = self.fee_estimates().await?;
        pick_fee_rate(&estimates, target_blocks)
    }
}

/// Rate for the closest target at or above `target_blocks`, rounded up
pub(crate) fn pick_fee_rate(estimates: &HashMap<String, f64>, target_blocks: u16) -> Result<u64> {
    let mut targets: Vec<(u16, f64)> = estimates
        .iter()
        .filter_map(|(k, v)| k.parse::<u16>().ok().map(|t| (t, *v)))
        .collect();
    targets.sort_by_key(|(t, _)| *t);

    targets
        .iter()
        .find(|(t, _)| *t >= target_blocks)
        .or_else(|| targets.last())
        .map(|(_, rate)| rate.ceil().max(1.0) as u64)
        .ok_or_else(|| SnowballError::FeeCalculation("no fee estimates available".to_string()))
}

fn parse_txid(raw: &str) -> Result<Txid> {
    Txid::from_str(raw.trim()).map_err(|e| SnowballError::Broadcast(format!("node returned invalid txid '{}': {}", raw, e)))
}

#[async_trait]
impl BroadcastBackend for EsploraClient {
    async fn submit(&self, signed_hex: &str) -> Result<Txid> {
        let url = format!("{}/tx", self.base_url);
        let url = url.as_str();
        let body = self
            .with_retry("/tx", SUBMIT_RETRIES, || async move {
                let response = self.client.post(url).body(signed_hex.to_string()).send().await?;
                let status = response.status();
                let text = response.text().await?;
                if status.is_success() {
                    Ok(text)
                } else {
                    Err(SnowballError::Broadcast(format!(
                        "broadcast rejected with status: {} ({})",
                        status,
                        text.trim()
                    )))
                }
            })
            .await?;

        let txid = parse_txid(&body)?;
        debug!("Transaction broadcast with ID: {}", txid);
        Ok(txid)
    }

    async fn query_mempool(&self, txid: &Txid) -> Result<bool> {
        // `/tx/:txid/status` reports unknown txids as unconfirmed, so look up the tx itself.
        let tx = self.get_optional::<EsploraTx>(&format!("/tx/{}", txid)).await?;
        Ok(matches!(tx, Some(tx) if !tx.status.confirmed))
    }

    async fn query_confirmation(&self, txid: &Txid) -> Result<ConfirmationStatus> {
        let tx = self.get_optional::<EsploraTx>(&format!("/tx/{}", txid)).await?;
        Ok(tx.map_or(ConfirmationStatus::Unknown, |tx| tx.status.into_confirmation()))
    }

    fn supports_unconfirmed_chaining(&self) -> bool {
        self.unconfirmed_chaining
    }
}

#[async_trait]
impl UtxoSource for EsploraClient {
    async fn list_spendable(&self, address: &Address) -> Result<Vec<Utxo>> {
        let utxos = self.get::<Vec<EsploraUtxo>>(&format!("/address/{}/utxo", address)).await?;
        let tip = if utxos.iter().any(|u| u.status.confirmed) {
            self.tip_height().await?
        } else {
            0
        };

        let script_pubkey = address.script_pubkey();
        let mut spendable = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let txid = match Txid::from_str(&utxo.txid) {
                Ok(txid) => txid,
                Err(e) => {
                    warn!("Skipping UTXO with invalid txid {}: {}", utxo.txid, e);
                    continue;
                }
            };
            let confirmations = match utxo.status.block_height {
                Some(height) if utxo.status.confirmed && tip >= height => (tip - height + 1) as u32,
                _ => 0,
            };
            spendable.push(Utxo {
                txid,
                vout: utxo.vout,
                value: utxo.value,
                script_pubkey: script_pubkey.clone(),
                confirmations,
            });
        }
        debug!("Got {} UTXOs for address: {}", spendable.len(), address);
        Ok(spendable)
    }
}
