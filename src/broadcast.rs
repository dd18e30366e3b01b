//! Ordered broadcast of chain transactions
//!
//! A submission is idempotent: a rejection counts as success when the expected
//! txid is already visible, so a resumed chain can resubmit its tip safely. A
//! node that accepts the transaction under a different txid has broken the
//! chain, and that is never retried.

use bitcoin::Txid;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{Result, SnowballError};
use crate::rpc::{BroadcastBackend, ConfirmationStatus};
use crate::signer::SignedTransaction;

/// Upper bound on a single retry delay
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Stops future submissions; anything already sent stays sent
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `CANCELLED` once the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SnowballError::Cancelled("cancellation requested".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    /// Broadcast, wait for acceptance, then the next
    Sequential,
    /// Submit the whole chain in order, then wait for every txid
    Parallel,
    /// Parallel when the backend relays unconfirmed chains
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub acceptance_timeout_ms: u64,
    pub acceptance_poll_interval_ms: u64,
    /// Bound on waiting for a block when the backend cannot chain unconfirmed
    pub confirmation_timeout_ms: u64,
    pub mode: BroadcastMode,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            acceptance_timeout_ms: 60_000,
            acceptance_poll_interval_ms: 1_000,
            confirmation_timeout_ms: 3_600_000,
            mode: BroadcastMode::Auto,
        }
    }
}

/// Outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub txid: Txid,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl BroadcastResult {
    /// Fail with `BROADCAST_ERROR` unless the submission succeeded
    pub fn into_accepted(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SnowballError::Broadcast(format!(
                "{} not accepted after {} retries: {}",
                self.txid,
                self.retry_count,
                self.error.as_deref().unwrap_or("unknown error")
            )))
        }
    }
}

/// Submits signed transactions through a `BroadcastBackend`
pub struct Broadcaster {
    backend: Arc<dyn BroadcastBackend>,
    config: BroadcastConfig,
    cancel: CancellationToken,
}

impl Broadcaster {
    pub fn new(backend: Arc<dyn BroadcastBackend>, config: BroadcastConfig, cancel: CancellationToken) -> Self {
        Self { backend, config, cancel }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn BroadcastBackend> {
        &self.backend
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mode after resolving `Auto` against the backend
    pub fn effective_mode(&self) -> BroadcastMode {
        match self.config.mode {
            BroadcastMode::Auto if self.backend.supports_unconfirmed_chaining() => BroadcastMode::Parallel,
            BroadcastMode::Auto => BroadcastMode::Sequential,
            mode => mode,
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
    }

    async fn already_visible(&self, txid: &Txid) -> bool {
        match self.backend.is_visible(txid).await {
            Ok(visible) => visible,
            Err(e) => {
                debug!("Visibility check for {} failed: {}", txid, e);
                false
            }
        }
    }

    /// Submit one signed transaction, retrying transient failures
    pub async fn broadcast_one(&self, signed_hex: &str, expected_txid: Txid) -> Result<BroadcastResult> {
        let mut retry_count = 0;
        loop {
            self.cancel.check()?;

            let error = match self.backend.submit(signed_hex).await {
                Ok(txid) if txid == expected_txid => {
                    debug!("Broadcast {} (retries: {})", txid, retry_count);
                    return Ok(BroadcastResult {
                        txid,
                        timestamp: Utc::now(),
                        retry_count,
                        success: true,
                        error: None,
                    });
                }
                Ok(txid) => {
                    return Err(SnowballError::ChainIntegrity(format!(
                        "node accepted {} but {} was expected",
                        txid, expected_txid
                    )));
                }
                Err(e) => e,
            };

            if self.already_visible(&expected_txid).await {
                info!("{} already known to the node, treating rejection as accepted", expected_txid);
                return Ok(BroadcastResult {
                    txid: expected_txid,
                    timestamp: Utc::now(),
                    retry_count,
                    success: true,
                    error: None,
                });
            }

            if !error.is_retryable() {
                return Err(error);
            }
            if retry_count >= self.config.max_retries {
                warn!("Giving up on {} after {} retries: {}", expected_txid, retry_count, error);
                return Ok(BroadcastResult {
                    txid: expected_txid,
                    timestamp: Utc::now(),
                    retry_count,
                    success: false,
                    error: Some(error.to_string()),
                });
            }

            let delay = self.retry_delay(retry_count);
            retry_count += 1;
            debug!(
                "Retrying broadcast of {} in {:?} (attempt {}/{}): {}",
                expected_txid, delay, retry_count, self.config.max_retries, error
            );
            sleep(delay).await;
        }
    }

    async fn poll_until<F>(&self, txid: &Txid, timeout_ms: u64, what: &str, done: F) -> Result<ConfirmationStatus>
    where
        F: Fn(&ConfirmationStatus) -> bool,
    {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let interval = Duration::from_millis(self.config.acceptance_poll_interval_ms.max(1));
        loop {
            let status = if self.backend.query_mempool(txid).await? {
                ConfirmationStatus::InMempool
            } else {
                self.backend.query_confirmation(txid).await?
            };
            if done(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(SnowballError::Timeout(format!(
                    "{} not {} within {} ms",
                    txid, what, timeout_ms
                )));
            }
            sleep(interval).await;
        }
    }

    /// Poll until `txid` is in the mempool or a block
    pub async fn wait_for_acceptance(&self, txid: &Txid, timeout_ms: u64) -> Result<ConfirmationStatus> {
        self.poll_until(txid, timeout_ms, "accepted", ConfirmationStatus::is_visible).await
    }

    /// Poll until `txid` is in a block
    pub async fn wait_for_confirmation(&self, txid: &Txid, timeout_ms: u64) -> Result<ConfirmationStatus> {
        self.poll_until(txid, timeout_ms, "confirmed", ConfirmationStatus::is_confirmed).await
    }

    /// What a sequential chain waits for before submitting the next step
    pub async fn wait_for_step(&self, txid: &Txid) -> Result<ConfirmationStatus> {
        if self.backend.supports_unconfirmed_chaining() {
            self.wait_for_acceptance(txid, self.config.acceptance_timeout_ms).await
        } else {
            self.wait_for_confirmation(txid, self.config.confirmation_timeout_ms).await
        }
    }

    /// Broadcast a parent and its children in chain order
    pub async fn broadcast_chain(
        &self,
        parent: &SignedTransaction,
        children: &[SignedTransaction],
    ) -> Result<Vec<BroadcastResult>> {
        let chain: Vec<&SignedTransaction> = std::iter::once(parent).chain(children.iter()).collect();
        let mode = self.effective_mode();
        info!("Broadcasting chain of {} transactions in {:?} mode", chain.len(), mode);

        let mut results = Vec::with_capacity(chain.len());
        match mode {
            BroadcastMode::Parallel => {
                for signed in &chain {
                    results.push(self.broadcast_one(&signed.hex, signed.txid).await?.into_accepted()?);
                }
                for signed in &chain {
                    self.wait_for_acceptance(&signed.txid, self.config.acceptance_timeout_ms).await?;
                }
            }
            _ => {
                for signed in &chain {
                    results.push(self.broadcast_one(&signed.hex, signed.txid).await?.into_accepted()?);
                    self.wait_for_step(&signed.txid).await?;
                }
            }
        }
        Ok(results)
    }
}
