//! Persisted mint orders
//!
//! An order is the durable record of one chain (snowball) or one batch of
//! chains (supercluster). It owns its progress: every signed step is recorded
//! with its raw hex before submission, which is what makes resume possible
//! after the process dies mid-chain.

pub mod manager;
pub mod store;

use bitcoin::{Network, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, Result, SnowballError};
use crate::types::{AddressType, AssetBalanceCheck, ContractId, TxKind};

pub use manager::OrderManager;
pub use store::{FilesystemStore, InMemoryStore, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Executing,
    Interrupted,
    Completed,
    RecoveryFailed,
    ParallelExecuting,
    PartialCompleted,
}

impl OrderStatus {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Executing, Interrupted)
                | (Executing, Completed)
                | (Interrupted, Executing)
                | (Interrupted, RecoveryFailed)
                | (Interrupted, ParallelExecuting)
                | (RecoveryFailed, Interrupted)
                | (ParallelExecuting, PartialCompleted)
                | (ParallelExecuting, Completed)
                | (ParallelExecuting, Interrupted)
                | (PartialCompleted, ParallelExecuting)
                | (PartialCompleted, RecoveryFailed)
        )
    }

    /// `VALIDATION_ERROR` for a transition outside the state machine
    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SnowballError::Validation(format!(
                "order cannot move from {} to {}",
                self, next
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed)
    }

    /// Statuses a counted resume attempt can pick up
    pub fn is_resumable(self) -> bool {
        matches!(self, OrderStatus::Interrupted | OrderStatus::PartialCompleted)
    }

    pub fn is_running(self) -> bool {
        matches!(self, OrderStatus::Executing | OrderStatus::ParallelExecuting)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Executing => "EXECUTING",
            OrderStatus::Interrupted => "INTERRUPTED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::RecoveryFailed => "RECOVERY_FAILED",
            OrderStatus::ParallelExecuting => "PARALLEL_EXECUTING",
            OrderStatus::PartialCompleted => "PARTIAL_COMPLETED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Snowball,
    Supercluster,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Snowball => f.write_str("snowball"),
            ExecutionMode::Supercluster => f.write_str("supercluster"),
        }
    }
}

/// Child-pays-for-parent settings for a composite parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpfpParams {
    /// Rate the parent+child package should reach, sat/vB
    pub package_fee_rate: u64,
    pub confirmation_timeout_ms: u64,
}

/// Parameters fixed at order creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    pub fee_rate: u64,
    /// Number of mint children (over all slices for supercluster)
    pub total_mints: u32,
    pub funding_address_type: AddressType,
    #[serde(default = "default_mints_per_slice")]
    pub mints_per_slice: u32,
    #[serde(default = "default_max_concurrent_slices")]
    pub max_concurrent_slices: usize,
    #[serde(default = "default_relay_index_spacing")]
    pub relay_index_spacing: u32,
    #[serde(default)]
    pub cpfp: Option<CpfpParams>,
}

fn default_mints_per_slice() -> u32 {
    25
}

fn default_max_concurrent_slices() -> usize {
    4
}

fn default_relay_index_spacing() -> u32 {
    1000
}

impl ExecutionParams {
    pub fn snowball(fee_rate: u64, total_mints: u32, funding_address_type: AddressType) -> Self {
        Self {
            fee_rate,
            total_mints,
            funding_address_type,
            mints_per_slice: default_mints_per_slice(),
            max_concurrent_slices: default_max_concurrent_slices(),
            relay_index_spacing: default_relay_index_spacing(),
            cpfp: None,
        }
    }

    pub fn supercluster(
        fee_rate: u64,
        total_mints: u32,
        funding_address_type: AddressType,
        mints_per_slice: u32,
        max_concurrent_slices: usize,
    ) -> Self {
        Self {
            mints_per_slice,
            max_concurrent_slices,
            ..Self::snowball(fee_rate, total_mints, funding_address_type)
        }
    }

    /// Tokens the receiver should end up with: one per child plus the parent's mint
    pub fn expected_tokens(&self) -> u128 {
        self.total_mints as u128 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Signed and recorded, submission not yet confirmed
    Signed,
    Broadcast,
}

/// One signed transaction of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    pub kind: TxKind,
    pub index: u32,
    pub txid: Txid,
    pub output_value: u64,
    pub fee: u64,
    pub raw_tx: String,
    pub state: StepState,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceProgress {
    pub slice_index: u32,
    pub status: SliceStatus,
    pub relay_address: String,
    pub relay_derivation_index: u32,
    pub parent_vout_index: u32,
    pub mint_count: u32,
    pub completed_child_txs: u32,
    pub last_txid: Option<Txid>,
    pub last_output_value: Option<u64>,
    #[serde(default)]
    pub steps: Vec<ChainStep>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderProgress {
    pub parent_txid: Option<Txid>,
    pub completed_child_count: u32,
    pub last_txid: Option<Txid>,
    pub last_output_value: Option<u64>,
    #[serde(default)]
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub slices: Vec<SliceProgress>,
    /// Receiver balance before the first transaction was sent
    #[serde(default)]
    pub receiver_baseline: Option<u128>,
    #[serde(default)]
    pub final_asset_balance: Option<AssetBalanceCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptInfo {
    pub reason: String,
    pub error_kind: ErrorKind,
    pub interrupted_at: DateTime<Utc>,
    /// Value left on the relay output when the chain stopped
    pub relay_balance: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub contract_id: ContractId,
    pub final_receiver_address: String,
    pub funding_address: String,
    pub network: Network,
    pub execution_mode: ExecutionMode,
    /// Relay derivation index (snowball); slices carry their own
    pub relay_wallet_index: Option<u32>,
    pub status: OrderStatus,
    pub execution_params: ExecutionParams,
    pub progress: OrderProgress,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub interrupt_info: Option<InterruptInfo>,
    pub recovery_info: Option<RecoveryInfo>,
}

impl Order {
    /// Status a freshly created order starts in
    pub fn initial_status(mode: ExecutionMode) -> OrderStatus {
        match mode {
            ExecutionMode::Snowball => OrderStatus::Executing,
            ExecutionMode::Supercluster => OrderStatus::ParallelExecuting,
        }
    }

    /// Status a resumed order runs in
    pub fn running_status(&self) -> OrderStatus {
        Self::initial_status(self.execution_mode)
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_info.as_ref().map_or(0, |r| r.attempts)
    }
}

/// Entry of the compact active-order index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIndexEntry {
    pub id: String,
    pub status: OrderStatus,
    pub execution_mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderIndexEntry {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            status: order.status,
            execution_mode: order.execution_mode,
            created_at: order.created_at,
        }
    }
}
