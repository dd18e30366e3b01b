//! Serial chain execution
//!
//! This module handles:
//! - Planning and funding checks for a new snowball order
//! - Building the whole chain up front so every txid is known before signing
//! - Signing, recording and broadcasting each step through the order manager
//! - Resuming an interrupted order from its last recorded step
//!
//! A resumed chain is rebuilt from the recorded tip with the same relay wallet
//! and the same per-hop fee, so it produces exactly the txids an uninterrupted
//! run would have.

use bitcoin::{Address, Txid};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::broadcast::{BroadcastMode, Broadcaster};
use crate::error::{Result, SnowballError};
use crate::fee::{self, FeeCalculation};
use crate::order::manager::NewOrder;
use crate::order::{ChainStep, ExecutionMode, ExecutionParams, Order, OrderManager, OrderStatus, StepState};
use crate::rpc::UtxoSource;
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::transaction::{validate_chain_integrity, ChainAnchor, TransactionBuilder};
use crate::types::{parse_address, AddressType, BuiltTransaction, ContractId, TxKind, RELAY_VOUT};
use crate::verify::{ChainMonitorState, ChainVerifier};
use crate::wallet::{ChainWallets, Wallet, WalletPool};

/// What the caller asks to mint
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub contract_id: ContractId,
    pub final_receiver_address: String,
    pub execution_mode: ExecutionMode,
    pub execution_params: ExecutionParams,
}

/// Anchor for the step after `step`
pub fn anchor_after(step: &ChainStep) -> ChainAnchor {
    ChainAnchor {
        txid: step.txid,
        vout: RELAY_VOUT,
        value: step.output_value,
    }
}

/// Recorded steps in chain order
pub(crate) fn ordered_steps(steps: &[ChainStep]) -> Vec<ChainStep> {
    let mut steps = steps.to_vec();
    steps.sort_by_key(|s| (s.kind == TxKind::Child, s.index));
    steps
}

/// Runs snowball chains and provides the step machinery the supercluster reuses
#[derive(Clone)]
pub struct ChainExecutor {
    pool: Arc<WalletPool>,
    builder: Arc<TransactionBuilder>,
    signer: Arc<dyn TransactionSigner>,
    broadcaster: Arc<Broadcaster>,
    utxos: Arc<dyn UtxoSource>,
    orders: Arc<OrderManager>,
    verifier: Option<Arc<ChainVerifier>>,
}

impl ChainExecutor {
    pub fn new(
        pool: Arc<WalletPool>,
        builder: Arc<TransactionBuilder>,
        signer: Arc<dyn TransactionSigner>,
        broadcaster: Arc<Broadcaster>,
        utxos: Arc<dyn UtxoSource>,
        orders: Arc<OrderManager>,
    ) -> Self {
        Self {
            pool,
            builder,
            signer,
            broadcaster,
            utxos,
            orders,
            verifier: None,
        }
    }

    /// Wait for confirmations and check the receiver balance before completing
    pub fn with_verifier(mut self, verifier: Arc<ChainVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn pool(&self) -> &WalletPool {
        &self.pool
    }

    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub(crate) async fn load(&self, order_id: &str) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| SnowballError::Validation(format!("order {} not found", order_id)))
    }

    pub fn receiver_of(&self, order: &Order) -> Result<Address> {
        parse_address(&order.final_receiver_address, self.pool.network())
    }

    /// Fail with `INSUFFICIENT_FUNDS` unless the funding wallet holds `required` sats
    pub(crate) async fn check_funding(&self, funding: &Wallet, required: u64) -> Result<()> {
        let utxos = self.utxos.list_spendable(&funding.address).await?;
        let available: u64 = utxos.iter().map(|u| u.value).sum();
        if available < required {
            return Err(SnowballError::InsufficientFunds(format!(
                "{} holds {} sats, {} sats required",
                funding.address, available, required
            )));
        }
        debug!("Funding {} holds {} sats ({} required)", funding.address, available, required);
        Ok(())
    }

    pub(crate) async fn spendable(&self, funding: &Wallet) -> Result<Vec<crate::types::Utxo>> {
        self.utxos.list_spendable(&funding.address).await
    }

    /// Fees for a serial chain paying `receiver`
    pub fn plan(&self, params: &ExecutionParams, receiver: &Address) -> Result<FeeCalculation> {
        fee::calculate_fees(params.fee_rate, params.total_mints, AddressType::of(receiver)?)
    }

    /// Validate, persist and run a new snowball order
    pub async fn start(&self, request: MintRequest) -> Result<Order> {
        if request.execution_mode != ExecutionMode::Snowball {
            return Err(SnowballError::Validation(
                "supercluster orders run through the parallel coordinator".to_string(),
            ));
        }
        let receiver = parse_address(&request.final_receiver_address, self.pool.network())?;
        let fees = self.plan(&request.execution_params, &receiver)?;
        let funding = self.pool.funding_wallet(request.execution_params.funding_address_type)?;
        self.check_funding(&funding, fees.total_required_funding).await?;

        let order = self
            .orders
            .create_order(NewOrder {
                contract_id: request.contract_id,
                final_receiver_address: receiver.to_string(),
                funding_address: funding.address.to_string(),
                network: self.pool.network(),
                execution_mode: ExecutionMode::Snowball,
                execution_params: request.execution_params,
            })
            .await?;
        self.record_baseline(&order).await?;
        self.execute(&order.id).await
    }

    /// Run an `EXECUTING` order to completion or interruption
    pub async fn execute(&self, order_id: &str) -> Result<Order> {
        let order = self.load(order_id).await?;
        if order.status != OrderStatus::Executing || order.execution_mode != ExecutionMode::Snowball {
            return Err(SnowballError::Validation(format!(
                "order {} is a {} order in {}, not an executing snowball order",
                order.id, order.execution_mode, order.status
            )));
        }

        let outcome = match self.run(&order).await {
            Ok(()) => self.verify(order_id).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => self.orders.mark_completed(order_id).await,
            Err(e) => {
                self.interrupt(order_id, &e).await;
                Err(e)
            }
        }
    }

    /// Resume an interrupted snowball order, counting the attempt.
    ///
    /// An order still `EXECUTING` was abandoned by a dead process and is
    /// reconciled and run without a status change.
    pub async fn resume(&self, order_id: &str) -> Result<Order> {
        let order = self.load(order_id).await?;
        if order.execution_mode != ExecutionMode::Snowball {
            return Err(SnowballError::Validation(format!("order {} is not a snowball order", order.id)));
        }
        if order.status.is_running() {
            warn!(
                "Order {} was left {} with {} recorded steps; picking it up",
                order.id,
                order.status,
                order.progress.steps.len()
            );
            return self.execute(order_id).await;
        }
        if !order.status.is_resumable() {
            return Err(SnowballError::Validation(format!(
                "order {} is {} and cannot be resumed",
                order.id, order.status
            )));
        }
        let order = self.orders.record_recovery_attempt(order_id).await?;
        if order.status == OrderStatus::RecoveryFailed {
            return Ok(order);
        }
        self.orders.mark_resuming(order_id).await?;
        info!(
            "Resuming order {} from step {} (attempt {})",
            order.id,
            order.progress.completed_child_count,
            order.recovery_attempts()
        );
        self.execute(order_id).await
    }

    /// Record an interruption, keeping the error that caused it
    pub(crate) async fn interrupt(&self, order_id: &str, cause: &SnowballError) {
        let relay_balance = match self.orders.get_order(order_id).await {
            Ok(Some(order)) => order.progress.last_output_value,
            _ => None,
        };
        if let Err(e) = self
            .orders
            .mark_interrupted(order_id, &cause.to_string(), cause.kind(), relay_balance)
            .await
        {
            error!("Failed to record interruption of {}: {}", order_id, e);
        }
    }

    fn chain_wallets(&self, order: &Order, relay_index: u32) -> Result<ChainWallets> {
        let receiver = self.receiver_of(order)?;
        self.pool
            .chain_wallets(order.execution_params.funding_address_type, relay_index, receiver)
    }

    async fn run(&self, order: &Order) -> Result<()> {
        let relay_index = order
            .relay_wallet_index
            .ok_or_else(|| SnowballError::Validation(format!("order {} has no relay wallet", order.id)))?;
        let wallets = self.chain_wallets(order, relay_index)?;
        let params = &order.execution_params;
        let fees = fee::calculate_fees(params.fee_rate, params.total_mints, wallets.final_receiver_type()?)?;
        let steps = ordered_steps(&order.progress.steps);

        let chain = match steps.last() {
            None => {
                let utxos = self.spendable(&wallets.funding).await?;
                let parent = self.builder.build_parent(&wallets, order.contract_id, &fees, &utxos)?;
                let children = self.builder.build_child_chain(
                    ChainAnchor::relay_of(&parent),
                    1,
                    params.total_mints,
                    &wallets,
                    order.contract_id,
                    fees.child_tx.total_fee,
                    None,
                )?;
                let mut chain = Vec::with_capacity(children.len() + 1);
                chain.push(parent);
                chain.extend(children);
                chain
            }
            Some(tip) => {
                self.reconcile(&order.id, None, &steps).await?;
                if tip.kind == TxKind::Child && tip.index >= params.total_mints {
                    info!("Order {}: all {} children already broadcast", order.id, params.total_mints);
                    return Ok(());
                }
                let from = if tip.kind == TxKind::Child { tip.index + 1 } else { 1 };
                self.builder.build_child_chain(
                    anchor_after(tip),
                    from,
                    params.total_mints,
                    &wallets,
                    order.contract_id,
                    fees.child_tx.total_fee,
                    None,
                )?
            }
        };

        validate_chain_integrity(&chain).into_result()?;
        self.submit_chain(&order.id, None, &chain, &wallets).await
    }

    /// Make recorded steps visible again.
    ///
    /// Steps still `signed` are resubmitted unless the node already knows them;
    /// a `broadcast` tip that has vanished (evicted, node restarted) is resubmitted too.
    pub(crate) async fn reconcile(&self, order_id: &str, slice: Option<u32>, steps: &[ChainStep]) -> Result<()> {
        let Some(tip) = steps.last() else {
            return Ok(());
        };
        for step in steps {
            let is_tip = step.txid == tip.txid;
            match step.state {
                StepState::Signed => {
                    self.ensure_visible(step).await?;
                    self.orders.mark_step_broadcast(order_id, slice, step.txid).await?;
                }
                StepState::Broadcast if is_tip => self.ensure_visible(step).await?,
                StepState::Broadcast => {}
            }
        }
        self.broadcaster.wait_for_step(&tip.txid).await?;
        Ok(())
    }

    async fn ensure_visible(&self, step: &ChainStep) -> Result<()> {
        if self.broadcaster.backend().is_visible(&step.txid).await? {
            return Ok(());
        }
        warn!("{} {} ({}) is not visible, resubmitting", step.kind, step.index, step.txid);
        self.broadcaster
            .broadcast_one(&step.raw_tx, step.txid)
            .await?
            .into_accepted()?;
        Ok(())
    }

    fn signing_wallet<'a>(built: &BuiltTransaction, wallets: &'a ChainWallets) -> &'a Wallet {
        match built.kind {
            TxKind::Child => &wallets.relay,
            TxKind::Parent | TxKind::CompositeParent => &wallets.funding,
        }
    }

    /// Sign `built` and persist it as `signed` before anything is submitted
    pub(crate) async fn sign_and_record(
        &self,
        order_id: &str,
        slice: Option<u32>,
        built: &BuiltTransaction,
        wallets: &ChainWallets,
    ) -> Result<SignedTransaction> {
        self.broadcaster.cancellation().check()?;
        let signed = self.signer.sign(built, Self::signing_wallet(built, wallets))?;
        self.orders
            .record_step(
                order_id,
                slice,
                ChainStep {
                    kind: built.kind,
                    index: built.index,
                    txid: signed.txid,
                    output_value: built.relay_output_value,
                    fee: built.fee,
                    raw_tx: signed.hex.clone(),
                    state: StepState::Signed,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        Ok(signed)
    }

    async fn broadcast_recorded(&self, order_id: &str, slice: Option<u32>, signed: &SignedTransaction) -> Result<()> {
        self.broadcaster
            .broadcast_one(&signed.hex, signed.txid)
            .await?
            .into_accepted()?;
        self.orders.mark_step_broadcast(order_id, slice, signed.txid).await?;
        Ok(())
    }

    /// Sign, record and broadcast `chain` in order
    pub(crate) async fn submit_chain(
        &self,
        order_id: &str,
        slice: Option<u32>,
        chain: &[BuiltTransaction],
        wallets: &ChainWallets,
    ) -> Result<()> {
        let label = slice.map_or_else(|| order_id.to_string(), |s| format!("{}#{}", order_id, s));
        match self.broadcaster.effective_mode() {
            BroadcastMode::Parallel => {
                let mut signed = Vec::with_capacity(chain.len());
                for built in chain {
                    signed.push(self.sign_and_record(order_id, slice, built, wallets).await?);
                }
                for tx in &signed {
                    self.broadcast_recorded(order_id, slice, tx).await?;
                }
                let timeout = self.broadcaster.config().acceptance_timeout_ms;
                for tx in &signed {
                    self.broadcaster.wait_for_acceptance(&tx.txid, timeout).await?;
                }
            }
            _ => {
                for built in chain {
                    let signed = self.sign_and_record(order_id, slice, built, wallets).await?;
                    self.broadcast_recorded(order_id, slice, &signed).await?;
                    self.broadcaster.wait_for_step(&signed.txid).await?;
                    debug!("{}: {} {} accepted", label, built.kind, built.index);
                }
            }
        }
        info!("{}: {} transactions broadcast", label, chain.len());
        Ok(())
    }

    /// Remember the receiver balance before anything is sent; unreadable means no baseline
    pub(crate) async fn record_baseline(&self, order: &Order) -> Result<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let receiver = self.receiver_of(order)?;
        match verifier.receiver_balance(&receiver, order.contract_id).await {
            Ok(balance) => {
                debug!("Order {}: receiver starts with {} of {}", order.id, balance, order.contract_id);
                self.orders
                    .update_order_progress(&order.id, |p| p.receiver_baseline = Some(balance))
                    .await?;
            }
            Err(e) => warn!("Order {}: receiver balance unavailable before send: {}", order.id, e),
        }
        Ok(())
    }

    /// Wait for every recorded step to confirm, then record the receiver balance check
    pub(crate) async fn verify(&self, order_id: &str) -> Result<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let order = self.load(order_id).await?;
        let receiver = self.receiver_of(&order)?;
        let tracked: Vec<(Txid, TxKind, u32)> = order
            .progress
            .steps
            .iter()
            .chain(order.progress.slices.iter().flat_map(|s| s.steps.iter()))
            .map(|s| (s.txid, s.kind, s.index))
            .collect();

        let mut state = ChainMonitorState::new(order.id.clone(), tracked);
        verifier
            .monitor(
                &mut state,
                &receiver,
                order.contract_id,
                order.execution_params.expected_tokens(),
                order.progress.receiver_baseline.unwrap_or(0),
            )
            .await?;
        if let Some(check) = state.final_asset_balance {
            if !check.verified {
                warn!(
                    "Order {}: receiver {} gained {} of {}, expected {}",
                    order.id,
                    check.address,
                    check.minted(),
                    order.contract_id,
                    check.expected
                );
            }
            self.orders
                .update_order_progress(order_id, |p| p.final_asset_balance = Some(check))
                .await?;
        }
        Ok(())
    }
}
