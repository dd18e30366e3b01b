//! Confirmation tracking and final balance verification
//!
//! The verifier polls every tracked transaction until all of them are in a
//! block, then reads the receiver's asset balance. The balance is judged
//! against the one read before the chain was sent, and a short balance is
//! reported in the monitor state rather than raised as an error.

use bitcoin::{Address, Txid};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{Result, SnowballError};
use crate::rpc::{AssetQuery, BroadcastBackend, ConfirmationStatus};
use crate::types::{ContractId, TxKind};

pub use crate::types::AssetBalanceCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub txid: Txid,
    pub kind: TxKind,
    pub index: u32,
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMonitorState {
    pub chain_id: String,
    pub transactions: Vec<TrackedTransaction>,
    pub overall_status: ChainStatus,
    pub final_asset_balance: Option<AssetBalanceCheck>,
}

impl ChainMonitorState {
    pub fn new(chain_id: impl Into<String>, transactions: impl IntoIterator<Item = (Txid, TxKind, u32)>) -> Self {
        Self {
            chain_id: chain_id.into(),
            transactions: transactions
                .into_iter()
                .map(|(txid, kind, index)| TrackedTransaction {
                    txid,
                    kind,
                    index,
                    confirmed: false,
                    block_height: None,
                })
                .collect(),
            overall_status: ChainStatus::Pending,
            final_asset_balance: None,
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.transactions.iter().filter(|t| t.confirmed).count()
    }

    pub fn all_confirmed(&self) -> bool {
        self.transactions.iter().all(|t| t.confirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub poll_interval_ms: u64,
    /// 0 waits forever
    pub max_wait_time_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_wait_time_ms: 0,
        }
    }
}

pub struct ChainVerifier {
    backend: Arc<dyn BroadcastBackend>,
    assets: Arc<dyn AssetQuery>,
    config: VerifyConfig,
}

impl ChainVerifier {
    pub fn new(backend: Arc<dyn BroadcastBackend>, assets: Arc<dyn AssetQuery>, config: VerifyConfig) -> Self {
        Self { backend, assets, config }
    }

    /// Refresh confirmation data for every unconfirmed transaction
    pub async fn poll_once(&self, state: &mut ChainMonitorState) -> Result<()> {
        for tracked in state.transactions.iter_mut().filter(|t| !t.confirmed) {
            if let ConfirmationStatus::Confirmed { block_height } = self.backend.query_confirmation(&tracked.txid).await? {
                tracked.confirmed = true;
                tracked.block_height = Some(block_height);
            }
        }
        state.overall_status = if state.all_confirmed() {
            ChainStatus::Completed
        } else if state.confirmed_count() > 0 {
            ChainStatus::InProgress
        } else {
            ChainStatus::Pending
        };
        Ok(())
    }

    /// Current balance of `receiver`, read before a chain is sent
    pub async fn receiver_balance(&self, receiver: &Address, contract_id: ContractId) -> Result<u128> {
        self.assets.balance_of(receiver, contract_id).await
    }

    /// Compare what the receiver gained since `baseline` with what the chain should have minted
    pub async fn check_balance(
        &self,
        receiver: &Address,
        contract_id: ContractId,
        expected: u128,
        baseline: u128,
    ) -> Result<AssetBalanceCheck> {
        let actual = self.assets.balance_of(receiver, contract_id).await?;
        let minted = actual.saturating_sub(baseline);
        let verified = minted >= expected;
        if !verified {
            warn!(
                "Receiver {} gained {} of {} (from {} to {}), expected {}",
                receiver, minted, contract_id, baseline, actual, expected
            );
        }
        Ok(AssetBalanceCheck {
            address: receiver.to_string(),
            baseline,
            expected,
            actual,
            verified,
        })
    }

    /// Poll until every transaction confirms, then verify the final balance.
    ///
    /// On timeout the state is left as `failed` and `TIMEOUT_ERROR` is returned.
    pub async fn monitor(
        &self,
        state: &mut ChainMonitorState,
        receiver: &Address,
        contract_id: ContractId,
        expected_tokens: u128,
        baseline: u128,
    ) -> Result<()> {
        let started = Instant::now();
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            self.poll_once(state).await?;
            debug!(
                "Chain {}: {}/{} confirmed",
                state.chain_id,
                state.confirmed_count(),
                state.transactions.len()
            );
            if state.all_confirmed() {
                break;
            }
            if self.config.max_wait_time_ms > 0
                && started.elapsed() >= Duration::from_millis(self.config.max_wait_time_ms)
            {
                state.overall_status = ChainStatus::Failed;
                return Err(SnowballError::Timeout(format!(
                    "chain {} had {}/{} confirmations after {} ms",
                    state.chain_id,
                    state.confirmed_count(),
                    state.transactions.len(),
                    self.config.max_wait_time_ms
                )));
            }
            sleep(interval).await;
        }

        let check = self.check_balance(receiver, contract_id, expected_tokens, baseline).await?;
        info!(
            "Chain {} confirmed; receiver balance {} (expected {}, verified: {})",
            state.chain_id, check.actual, check.expected, check.verified
        );
        state.final_asset_balance = Some(check);
        state.overall_status = ChainStatus::Completed;
        Ok(())
    }
}
