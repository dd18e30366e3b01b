//! Parallel minting across slices
//!
//! A supercluster order splits its mints into slices of at most
//! `mints_per_slice` children. One composite parent funds every slice's relay
//! wallet, then the slice chains run concurrently. A failing slice does not
//! stop its siblings; the order ends `PARTIAL_COMPLETED` and a later resume
//! retries only the slices that did not finish.

use bitcoin::{Address, Txid};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::chain::{anchor_after, ordered_steps, ChainExecutor, MintRequest};
use crate::error::{ErrorKind, Result, SnowballError};
use crate::fee::{self, TxFee, SAFETY_BUFFER_SATS};
use crate::order::manager::NewOrder;
use crate::order::{ExecutionMode, ExecutionParams, Order, OrderStatus, SliceProgress, SliceStatus};
use crate::transaction::{validate_chain_integrity, ChainAnchor, SliceFunding};
use crate::types::{parse_address, AddressType, TxKind};
use crate::wallet::ChainWallets;

/// Smallest gap between the relay derivation indices of two slices
pub const MIN_RELAY_INDEX_SPACING: u32 = 1000;

/// Split `total_mints` into slices of at most `mints_per_slice` (77 by 25 is 25, 25, 25, 2)
pub fn plan_slices(total_mints: u32, mints_per_slice: u32) -> Result<Vec<u32>> {
    if total_mints == 0 || mints_per_slice == 0 {
        return Err(SnowballError::Validation(format!(
            "cannot split {} mints into slices of {}",
            total_mints, mints_per_slice
        )));
    }
    let full = total_mints / mints_per_slice;
    let mut slices = vec![mints_per_slice; full as usize];
    if total_mints % mints_per_slice != 0 {
        slices.push(total_mints % mints_per_slice);
    }
    Ok(slices)
}

/// Funding layout of a supercluster order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPlan {
    pub slice_mints: Vec<u32>,
    /// Value of each slice's relay output in the composite parent
    pub slice_values: Vec<u64>,
    pub child_fee: TxFee,
    /// Fee of slice 0's first child when CPFP is requested
    pub cpfp_child_fee: Option<u64>,
    pub parent_vsize: u64,
    pub parent_fee: u64,
    pub total_required_funding: u64,
}

/// Compute slice sizes, per-slice relay values and the funding requirement
pub fn plan_cluster(params: &ExecutionParams, receiver_type: AddressType) -> Result<ClusterPlan> {
    fee::validate_fee_rate(params.fee_rate)?;
    if params.relay_index_spacing < MIN_RELAY_INDEX_SPACING {
        return Err(SnowballError::Validation(format!(
            "relay index spacing {} is below {}",
            params.relay_index_spacing, MIN_RELAY_INDEX_SPACING
        )));
    }
    let slice_mints = plan_slices(params.total_mints, params.mints_per_slice)?;
    let child_fee = fee::child_fee(params.fee_rate, receiver_type)?;
    let dust = receiver_type.dust_threshold();

    let funding_type = params.funding_address_type;
    let parent_vsize = fee::composite_parent_vsize(funding_type, 1, slice_mints.len(), Some(funding_type))?;
    let parent_fee = parent_vsize * params.fee_rate;

    let cpfp_child_fee = match params.cpfp {
        Some(cpfp) => Some(
            fee::cpfp_child_fee(cpfp.package_fee_rate, parent_vsize, parent_fee, child_fee.virtual_size)?
                .max(child_fee.total_fee),
        ),
        None => None,
    };

    let slice_values: Vec<u64> = slice_mints
        .iter()
        .enumerate()
        .map(|(i, mints)| {
            let base = *mints as u64 * child_fee.total_fee + dust;
            match cpfp_child_fee {
                Some(cpfp) if i == 0 => base + (cpfp - child_fee.total_fee),
                _ => base,
            }
        })
        .collect();
    let total_required_funding = slice_values.iter().sum::<u64>() + parent_fee + SAFETY_BUFFER_SATS;

    debug!(
        "Planned {} slices for {} mints: child fee {} sats, parent fee {} sats, funding {} sats",
        slice_mints.len(),
        params.total_mints,
        child_fee.total_fee,
        parent_fee,
        total_required_funding
    );
    Ok(ClusterPlan {
        slice_mints,
        slice_values,
        child_fee,
        cpfp_child_fee,
        parent_vsize,
        parent_fee,
        total_required_funding,
    })
}

/// Runs supercluster orders on top of a `ChainExecutor`
pub struct ParallelCoordinator {
    executor: ChainExecutor,
}

impl ParallelCoordinator {
    pub fn new(executor: ChainExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ChainExecutor {
        &self.executor
    }

    /// Validate, persist and run a new supercluster order
    pub async fn start(&self, request: MintRequest) -> Result<Order> {
        if request.execution_mode != ExecutionMode::Supercluster {
            return Err(SnowballError::Validation(
                "snowball orders run through the chain executor".to_string(),
            ));
        }
        let pool = self.executor.pool();
        let receiver = parse_address(&request.final_receiver_address, pool.network())?;
        let plan = plan_cluster(&request.execution_params, AddressType::of(&receiver)?)?;
        let funding = pool.funding_wallet(request.execution_params.funding_address_type)?;
        self.executor.check_funding(&funding, plan.total_required_funding).await?;

        let order = self
            .executor
            .orders()
            .create_order(NewOrder {
                contract_id: request.contract_id,
                final_receiver_address: receiver.to_string(),
                funding_address: funding.address.to_string(),
                network: pool.network(),
                execution_mode: ExecutionMode::Supercluster,
                execution_params: request.execution_params,
            })
            .await?;
        self.executor.record_baseline(&order).await?;
        self.execute(&order.id).await
    }

    /// Run a `PARALLEL_EXECUTING` order until every slice has finished or failed
    pub async fn execute(&self, order_id: &str) -> Result<Order> {
        let order = self.executor.load(order_id).await?;
        if order.status != OrderStatus::ParallelExecuting {
            return Err(SnowballError::Validation(format!(
                "order {} is {}, not PARALLEL_EXECUTING",
                order.id, order.status
            )));
        }

        let first_failure = match self.run(&order).await {
            Ok(failure) => failure,
            Err(e) => {
                self.executor.interrupt(order_id, &e).await;
                return Err(e);
            }
        };

        let orders = self.executor.orders();
        let order = self.executor.load(order_id).await?;
        let total = order.progress.slices.len();
        let unfinished = order
            .progress
            .slices
            .iter()
            .filter(|s| s.status != SliceStatus::Completed)
            .count();

        if unfinished == 0 {
            if let Err(e) = self.executor.verify(order_id).await {
                self.executor.interrupt(order_id, &e).await;
                return Err(e);
            }
            return orders.mark_completed(order_id).await;
        }

        let (kind, reason) = first_failure
            .map(|(slice, e)| (e.kind(), format!("slice {}: {}", slice, e)))
            .unwrap_or((ErrorKind::BroadcastError, "slices did not finish".to_string()));
        if unfinished == total {
            let relay_balance = order
                .progress
                .slices
                .iter()
                .filter_map(|s| s.last_output_value)
                .sum::<u64>();
            orders
                .mark_interrupted(order_id, &reason, kind, Some(relay_balance))
                .await?;
            return Err(SnowballError::Broadcast(format!("every slice of {} failed; {}", order_id, reason)));
        }
        warn!("Order {}: {}/{} slices unfinished", order_id, unfinished, total);
        orders
            .mark_partial_completed(order_id, &format!("{} of {} slices failed; {}", unfinished, total, reason), kind)
            .await
    }

    /// Resume an interrupted, partially completed or abandoned order, retrying unfinished slices only
    pub async fn resume(&self, order_id: &str) -> Result<Order> {
        let orders = self.executor.orders();
        let order = self.executor.load(order_id).await?;
        if order.execution_mode != ExecutionMode::Supercluster {
            return Err(SnowballError::Validation(format!("order {} is not a supercluster order", order.id)));
        }
        if order.status.is_running() {
            warn!("Order {} was left {}; picking it up", order.id, order.status);
            return self.execute(order_id).await;
        }
        if !order.status.is_resumable() {
            return Err(SnowballError::Validation(format!(
                "order {} is {} and cannot be resumed",
                order.id, order.status
            )));
        }
        let order = orders.record_recovery_attempt(order_id).await?;
        if order.status == OrderStatus::RecoveryFailed {
            return Ok(order);
        }
        let recoverable = orders.get_recoverable_slices(order_id).await?;
        info!(
            "Resuming order {} with {} unfinished slices (attempt {})",
            order.id,
            recoverable.len(),
            order.recovery_attempts()
        );
        orders.mark_resuming(order_id).await?;
        self.execute(order_id).await
    }

    /// Everything up to and including the slices; returns the first slice failure
    async fn run(&self, order: &Order) -> Result<Option<(u32, SnowballError)>> {
        let receiver = self.executor.receiver_of(order)?;
        let plan = plan_cluster(&order.execution_params, AddressType::of(&receiver)?)?;

        let order = self.ensure_slices(order, &plan).await?;
        let parent_txid = self.ensure_parent(&order, &plan, &receiver).await?;
        self.accelerate(&order, &plan, parent_txid, &receiver).await?;

        let order = self.executor.load(&order.id).await?;
        let pending: Vec<SliceProgress> = order
            .progress
            .slices
            .iter()
            .filter(|s| s.status != SliceStatus::Completed)
            .cloned()
            .collect();
        let concurrency = order.execution_params.max_concurrent_slices.max(1);
        info!(
            "Order {}: running {} slices, {} at a time",
            order.id,
            pending.len(),
            concurrency
        );

        let results: Vec<(u32, Result<()>)> = stream::iter(pending)
            .map(|slice| self.run_slice(&order, slice, &plan, parent_txid, &receiver))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut failures: Vec<(u32, SnowballError)> = results
            .into_iter()
            .filter_map(|(index, result)| result.err().map(|e| (index, e)))
            .collect();
        failures.sort_by_key(|(index, _)| *index);
        Ok(failures.into_iter().next())
    }

    fn slice_wallets(&self, order: &Order, slice: &SliceProgress, receiver: &Address) -> Result<ChainWallets> {
        self.executor.pool().chain_wallets(
            order.execution_params.funding_address_type,
            slice.relay_derivation_index,
            receiver.clone(),
        )
    }

    /// Persist the slice layout the first time an order runs
    async fn ensure_slices(&self, order: &Order, plan: &ClusterPlan) -> Result<Order> {
        if !order.progress.slices.is_empty() {
            return Ok(order.clone());
        }
        let base = order
            .relay_wallet_index
            .ok_or_else(|| SnowballError::Validation(format!("order {} has no relay base index", order.id)))?;
        let spacing = order.execution_params.relay_index_spacing;

        let mut slices = Vec::with_capacity(plan.slice_mints.len());
        for (i, (mints, value)) in plan.slice_mints.iter().zip(&plan.slice_values).enumerate() {
            let slice_index = i as u32;
            let relay_index = slice_index
                .checked_mul(spacing)
                .and_then(|offset| base.checked_add(offset))
                .ok_or_else(|| SnowballError::Validation("relay derivation index overflows".to_string()))?;
            let relay = self.executor.pool().relay_wallet(relay_index)?;
            slices.push(SliceProgress {
                slice_index,
                status: SliceStatus::Pending,
                relay_address: relay.address.to_string(),
                relay_derivation_index: relay_index,
                parent_vout_index: slice_index,
                mint_count: *mints,
                completed_child_txs: 0,
                last_txid: None,
                last_output_value: Some(*value),
                steps: Vec::new(),
                error: None,
            });
        }
        self.executor
            .orders()
            .update_order_progress(&order.id, |progress| progress.slices = slices)
            .await
    }

    /// Broadcast the composite parent, or make a recorded one visible again
    async fn ensure_parent(&self, order: &Order, plan: &ClusterPlan, receiver: &Address) -> Result<Txid> {
        let steps = ordered_steps(&order.progress.steps);
        if let Some(parent) = steps.iter().find(|s| s.kind == TxKind::CompositeParent) {
            self.executor.reconcile(&order.id, None, &steps).await?;
            return Ok(parent.txid);
        }

        let network = self.executor.pool().network();
        let funding_slices = order
            .progress
            .slices
            .iter()
            .zip(&plan.slice_values)
            .map(|(slice, value)| {
                Ok(SliceFunding {
                    relay_address: parse_address(&slice.relay_address, network)?,
                    value: *value,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let first_slice = order
            .progress
            .slices
            .first()
            .ok_or_else(|| SnowballError::Validation(format!("order {} has no slices", order.id)))?;
        let wallets = self.slice_wallets(order, first_slice, receiver)?;
        let utxos = self.executor.spendable(&wallets.funding).await?;
        let parent = self.executor.builder().build_composite_parent(
            &wallets.funding,
            &funding_slices,
            order.contract_id,
            order.execution_params.fee_rate,
            &utxos,
        )?;
        let txid = parent.expected_txid;
        self.executor
            .submit_chain(&order.id, None, std::slice::from_ref(&parent), &wallets)
            .await?;
        info!("Order {}: composite parent {} funds {} slices", order.id, txid, funding_slices.len());
        Ok(txid)
    }

    /// Broadcast slice 0's first child at the CPFP fee and give the package time to confirm
    async fn accelerate(&self, order: &Order, plan: &ClusterPlan, parent_txid: Txid, receiver: &Address) -> Result<()> {
        let (Some(cpfp), Some(cpfp_fee)) = (order.execution_params.cpfp, plan.cpfp_child_fee) else {
            return Ok(());
        };
        let Some(slice) = order.progress.slices.first() else {
            return Ok(());
        };
        if !slice.steps.is_empty() {
            return Ok(());
        }

        let wallets = self.slice_wallets(order, slice, receiver)?;
        let anchor = ChainAnchor {
            txid: parent_txid,
            vout: slice.parent_vout_index,
            value: plan.slice_values[0],
        };
        let child = self.executor.builder().build_child_at(
            anchor,
            1,
            slice.mint_count == 1,
            &wallets,
            order.contract_id,
            cpfp_fee,
        )?;
        info!(
            "Order {}: CPFP child {} pays {} sats for a {} sat/vB package",
            order.id, child.expected_txid, cpfp_fee, cpfp.package_fee_rate
        );
        self.executor
            .submit_chain(&order.id, Some(slice.slice_index), std::slice::from_ref(&child), &wallets)
            .await?;

        match self
            .executor
            .broadcaster()
            .wait_for_confirmation(&child.expected_txid, cpfp.confirmation_timeout_ms)
            .await
        {
            Ok(_) => info!("Order {}: CPFP package confirmed", order.id),
            Err(e) if e.kind() == ErrorKind::TimeoutError => {
                warn!("Order {}: CPFP package unconfirmed, continuing: {}", order.id, e)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn run_slice(
        &self,
        order: &Order,
        slice: SliceProgress,
        plan: &ClusterPlan,
        parent_txid: Txid,
        receiver: &Address,
    ) -> (u32, Result<()>) {
        let index = slice.slice_index;
        let result = self.drive_slice(order, &slice, plan, parent_txid, receiver).await;
        let update = match &result {
            Ok(()) => {
                info!("Order {}: slice {} completed", order.id, index);
                self.executor
                    .orders()
                    .update_slice(&order.id, index, |s| {
                        s.status = SliceStatus::Completed;
                        s.error = None;
                    })
                    .await
            }
            Err(e) => {
                warn!("Order {}: slice {} failed: {}", order.id, index, e);
                let message = e.to_string();
                self.executor
                    .orders()
                    .update_slice(&order.id, index, |s| {
                        s.status = SliceStatus::Failed;
                        s.error = Some(message);
                    })
                    .await
            }
        };
        if let Err(e) = update {
            error!("Failed to record slice {} of {}: {}", index, order.id, e);
        }
        (index, result)
    }

    async fn drive_slice(
        &self,
        order: &Order,
        slice: &SliceProgress,
        plan: &ClusterPlan,
        parent_txid: Txid,
        receiver: &Address,
    ) -> Result<()> {
        let index = slice.slice_index;
        self.executor
            .orders()
            .update_slice(&order.id, index, |s| s.status = SliceStatus::Executing)
            .await?;

        // Re-read: CPFP may have added slice 0's first step since `order` was loaded.
        let current = self.executor.load(&order.id).await?;
        let steps = current
            .progress
            .slices
            .iter()
            .find(|s| s.slice_index == index)
            .map(|s| ordered_steps(&s.steps))
            .unwrap_or_default();

        let wallets = self.slice_wallets(order, slice, receiver)?;
        let (anchor, from) = match steps.last() {
            None => {
                let value = plan.slice_values.get(index as usize).copied().ok_or_else(|| {
                    SnowballError::Validation(format!("slice {} is not part of the plan", index))
                })?;
                let anchor = ChainAnchor {
                    txid: parent_txid,
                    vout: slice.parent_vout_index,
                    value,
                };
                (anchor, 1)
            }
            Some(tip) => {
                self.executor.reconcile(&order.id, Some(index), &steps).await?;
                (anchor_after(tip), tip.index + 1)
            }
        };
        if from > slice.mint_count {
            return Ok(());
        }

        let first_fee = if index == 0 && from == 1 { plan.cpfp_child_fee } else { None };
        let chain = self.executor.builder().build_child_chain(
            anchor,
            from,
            slice.mint_count,
            &wallets,
            order.contract_id,
            plan.child_fee.total_fee,
            first_fee,
        )?;
        validate_chain_integrity(&chain).into_result()?;
        self.executor.submit_chain(&order.id, Some(index), &chain, &wallets).await
    }
}
