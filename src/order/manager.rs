//! Order lifecycle on top of a `KvStore`
//!
//! All writes go through one async mutex so concurrent slices of the same
//! order never overwrite each other's progress.

use bitcoin::{Network, Txid};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::store::KvStore;
use super::{
    ChainStep, ExecutionMode, ExecutionParams, InterruptInfo, Order, OrderIndexEntry, OrderProgress, OrderStatus,
    RecoveryInfo, SliceProgress, SliceStatus, StepState,
};
use crate::error::{ErrorKind, Result, SnowballError};
use crate::types::{ContractId, TxKind};

const ORDER_PREFIX: &str = "orders/";
const INDEX_KEY: &str = "index/active_orders";
const RELAY_CURSOR_KEY: &str = "meta/relay_cursor";

/// Default bound on resume attempts before an order is parked as `RECOVERY_FAILED`
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Everything needed to open an order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub contract_id: ContractId,
    pub final_receiver_address: String,
    pub funding_address: String,
    pub network: Network,
    pub execution_mode: ExecutionMode,
    pub execution_params: ExecutionParams,
}

fn order_key(id: &str) -> String {
    format!("{}{}", ORDER_PREFIX, id)
}

fn new_order_id() -> String {
    format!("sb-{}-{:08x}", Utc::now().format("%Y%m%d%H%M%S"), rand::random::<u32>())
}

/// Steps of the whole chain or of one slice
fn steps_mut<'a>(progress: &'a mut OrderProgress, slice: Option<u32>) -> Result<&'a mut Vec<ChainStep>> {
    match slice {
        None => Ok(&mut progress.steps),
        Some(index) => progress
            .slices
            .iter_mut()
            .find(|s| s.slice_index == index)
            .map(|s| &mut s.steps)
            .ok_or_else(|| SnowballError::Validation(format!("unknown slice {}", index))),
    }
}

pub struct OrderManager {
    store: Arc<dyn KvStore>,
    max_recovery_attempts: u32,
    write_lock: Mutex<()>,
}

impl OrderManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_max_recovery_attempts(store, DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }

    pub fn with_max_recovery_attempts(store: Arc<dyn KvStore>, max_recovery_attempts: u32) -> Self {
        Self {
            store,
            max_recovery_attempts,
            write_lock: Mutex::new(()),
        }
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        self.max_recovery_attempts
    }

    async fn load(&self, id: &str) -> Result<Order> {
        self.get_order(id)
            .await?
            .ok_or_else(|| SnowballError::Validation(format!("order {} not found", id)))
    }

    async fn load_index(&self) -> Result<Vec<OrderIndexEntry>> {
        match self.store.get(INDEX_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Write the order and refresh its index entry. Callers hold `write_lock`.
    async fn save(&self, order: &Order) -> Result<()> {
        self.store.put(&order_key(&order.id), &serde_json::to_string_pretty(order)?).await?;

        let mut index = self.load_index().await?;
        index.retain(|entry| entry.id != order.id);
        if !order.status.is_terminal() {
            index.push(OrderIndexEntry::from(order));
            index.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
        self.store.put(INDEX_KEY, &serde_json::to_string(&index)?).await
    }

    /// Load, mutate and save one order under the write lock
    async fn modify<F>(&self, id: &str, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut order = self.load(id).await?;
        f(&mut order)?;
        order.last_updated_at = Utc::now();
        self.save(&order).await?;
        Ok(order)
    }

    /// Reserve `span` consecutive relay derivation indices, returning the first
    async fn allocate_relay_indices(&self, span: u32) -> Result<u32> {
        let base = match self.store.get(RELAY_CURSOR_KEY).await? {
            Some(raw) => serde_json::from_str::<u32>(&raw)?,
            None => 0,
        };
        let next = base
            .checked_add(span)
            .ok_or_else(|| SnowballError::Storage("relay derivation indices exhausted".to_string()))?;
        self.store.put(RELAY_CURSOR_KEY, &next.to_string()).await?;
        Ok(base)
    }

    pub async fn create_order(&self, new: NewOrder) -> Result<Order> {
        let _guard = self.write_lock.lock().await;

        let span = match new.execution_mode {
            ExecutionMode::Snowball => 1,
            ExecutionMode::Supercluster => {
                let params = &new.execution_params;
                let slices = params.total_mints.div_ceil(params.mints_per_slice.max(1));
                slices
                    .checked_mul(params.relay_index_spacing.max(1))
                    .ok_or_else(|| SnowballError::Validation("relay index span overflows".to_string()))?
            }
        };
        let relay_index = self.allocate_relay_indices(span).await?;

        let now = Utc::now();
        let order = Order {
            id: new_order_id(),
            contract_id: new.contract_id,
            final_receiver_address: new.final_receiver_address,
            funding_address: new.funding_address,
            network: new.network,
            execution_mode: new.execution_mode,
            relay_wallet_index: Some(relay_index),
            status: Order::initial_status(new.execution_mode),
            execution_params: new.execution_params,
            progress: OrderProgress::default(),
            created_at: now,
            last_updated_at: now,
            completed_at: None,
            interrupt_info: None,
            recovery_info: None,
        };
        self.save(&order).await?;
        info!(
            "Created {} order {} for {} (relay index {})",
            order.execution_mode, order.id, order.contract_id, relay_index
        );
        Ok(order)
    }

    pub async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        match self.store.get(&order_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every stored order, oldest first
    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        for key in self.store.list_by_prefix(ORDER_PREFIX).await? {
            if let Some(raw) = self.store.get(&key).await? {
                match serde_json::from_str::<Order>(&raw) {
                    Ok(order) => orders.push(order),
                    Err(e) => warn!("Skipping unreadable order record {}: {}", key, e),
                }
            }
        }
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    pub async fn update_order_progress<F>(&self, id: &str, f: F) -> Result<Order>
    where
        F: FnOnce(&mut OrderProgress),
    {
        self.modify(id, |order| {
            f(&mut order.progress);
            Ok(())
        })
        .await
    }

    /// Record a signed step before it is submitted; re-recording the same step replaces it
    pub async fn record_step(&self, id: &str, slice: Option<u32>, step: ChainStep) -> Result<Order> {
        debug!("Order {}: recording {} {} as {}", id, step.kind, step.index, step.txid);
        self.modify(id, |order| {
            let steps = steps_mut(&mut order.progress, slice)?;
            steps.retain(|s| !(s.kind == step.kind && s.index == step.index));
            steps.push(step);
            Ok(())
        })
        .await
    }

    /// Flip a recorded step to `broadcast` and advance the chain tip
    pub async fn mark_step_broadcast(&self, id: &str, slice: Option<u32>, txid: Txid) -> Result<Order> {
        self.modify(id, |order| {
            let steps = steps_mut(&mut order.progress, slice)?;
            let step = steps
                .iter_mut()
                .find(|s| s.txid == txid)
                .ok_or_else(|| SnowballError::Validation(format!("no recorded step {}", txid)))?;
            step.state = StepState::Broadcast;
            let (kind, index, output_value) = (step.kind, step.index, step.output_value);

            match slice {
                None => {
                    let progress = &mut order.progress;
                    match kind {
                        TxKind::Parent | TxKind::CompositeParent => progress.parent_txid = Some(txid),
                        TxKind::Child => progress.completed_child_count = progress.completed_child_count.max(index),
                    }
                    progress.last_txid = Some(txid);
                    progress.last_output_value = Some(output_value);
                }
                Some(slice_index) => {
                    if let Some(slice) = order.progress.slices.iter_mut().find(|s| s.slice_index == slice_index) {
                        slice.completed_child_txs = slice.completed_child_txs.max(index);
                        slice.last_txid = Some(txid);
                        slice.last_output_value = Some(output_value);
                    }
                    order.progress.completed_child_count =
                        order.progress.slices.iter().map(|s| s.completed_child_txs).sum();
                    order.progress.last_txid = Some(txid);
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn update_slice<F>(&self, id: &str, slice_index: u32, f: F) -> Result<Order>
    where
        F: FnOnce(&mut SliceProgress),
    {
        self.modify(id, |order| {
            let slice = order
                .progress
                .slices
                .iter_mut()
                .find(|s| s.slice_index == slice_index)
                .ok_or_else(|| SnowballError::Validation(format!("unknown slice {}", slice_index)))?;
            f(slice);
            Ok(())
        })
        .await
    }

    pub async fn mark_interrupted(
        &self,
        id: &str,
        reason: &str,
        kind: ErrorKind,
        relay_balance: Option<u64>,
    ) -> Result<Order> {
        warn!("Order {} interrupted ({}): {}", id, kind, reason);
        self.modify(id, |order| {
            if order.status != OrderStatus::Interrupted {
                order.status = order.status.transition(OrderStatus::Interrupted)?;
            }
            order.interrupt_info = Some(InterruptInfo {
                reason: reason.to_string(),
                error_kind: kind,
                interrupted_at: Utc::now(),
                relay_balance,
            });
            if let Some(recovery) = order.recovery_info.as_mut() {
                recovery.last_error = Some(reason.to_string());
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_completed(&self, id: &str) -> Result<Order> {
        info!("Order {} completed", id);
        self.modify(id, |order| {
            order.status = order.status.transition(OrderStatus::Completed)?;
            order.completed_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    pub async fn mark_partial_completed(&self, id: &str, reason: &str, kind: ErrorKind) -> Result<Order> {
        warn!("Order {} partially completed: {}", id, reason);
        self.modify(id, |order| {
            order.status = order.status.transition(OrderStatus::PartialCompleted)?;
            order.interrupt_info = Some(InterruptInfo {
                reason: reason.to_string(),
                error_kind: kind,
                interrupted_at: Utc::now(),
                relay_balance: None,
            });
            Ok(())
        })
        .await
    }

    /// Move a resumable order back to its running status
    pub async fn mark_resuming(&self, id: &str) -> Result<Order> {
        self.modify(id, |order| {
            if !order.status.is_resumable() {
                return Err(SnowballError::Validation(format!(
                    "order {} is {} and cannot be resumed",
                    order.id, order.status
                )));
            }
            order.status = order.status.transition(order.running_status())?;
            info!("Order {} resuming as {}", order.id, order.status);
            Ok(())
        })
        .await
    }

    /// Count a resume attempt; past the bound the order becomes `RECOVERY_FAILED`
    pub async fn record_recovery_attempt(&self, id: &str) -> Result<Order> {
        let max = self.max_recovery_attempts;
        self.modify(id, |order| {
            let recovery = order.recovery_info.get_or_insert_with(RecoveryInfo::default);
            if recovery.attempts >= max {
                warn!("Order {} exhausted {} recovery attempts", order.id, max);
                order.status = order.status.transition(OrderStatus::RecoveryFailed)?;
                return Ok(());
            }
            recovery.attempts += 1;
            recovery.last_attempt_at = Some(Utc::now());
            debug!("Order {} recovery attempt {}/{}", order.id, recovery.attempts, max);
            Ok(())
        })
        .await
    }

    /// Operator reset to `INTERRUPTED` with a fresh attempt budget.
    ///
    /// Accepts `RECOVERY_FAILED` and an order that is already `INTERRUPTED`.
    pub async fn reset_order_to_interrupted(&self, id: &str) -> Result<Order> {
        self.modify(id, |order| {
            if order.status != OrderStatus::Interrupted {
                order.status = order.status.transition(OrderStatus::Interrupted)?;
            }
            order.recovery_info = Some(RecoveryInfo::default());
            info!("Order {} reset to INTERRUPTED", order.id);
            Ok(())
        })
        .await
    }

    /// Resumable orders, found through the active index only.
    ///
    /// Includes orders still marked running, which is how an order looks
    /// after its process died without recording the interruption.
    pub async fn get_interrupted_orders(&self) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        for entry in self.load_index().await? {
            if !entry.status.is_resumable() && !entry.status.is_running() {
                continue;
            }
            match self.get_order(&entry.id).await? {
                Some(order) => orders.push(order),
                None => warn!("Index references missing order {}", entry.id),
            }
        }
        Ok(orders)
    }

    /// Slices of a supercluster order that still have work to do
    pub async fn get_recoverable_slices(&self, id: &str) -> Result<Vec<SliceProgress>> {
        let order = self.load(id).await?;
        Ok(order
            .progress
            .slices
            .into_iter()
            .filter(|s| s.status != SliceStatus::Completed)
            .collect())
    }
}
