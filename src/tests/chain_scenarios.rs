//! Whole orders against the mock chain

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network};
use std::sync::Arc;

use super::mock_chain::MockChain;
use crate::broadcast::{BroadcastConfig, BroadcastMode, Broadcaster, CancellationToken};
use crate::chain::{ChainExecutor, MintRequest};
use crate::error::{ErrorKind, SnowballError};
use crate::fee;
use crate::order::manager::NewOrder;
use crate::order::store::InMemoryStore;
use crate::order::{
    CpfpParams, ExecutionMode, ExecutionParams, OrderManager, OrderStatus, SliceStatus, StepState,
};
use crate::protostone::RunestoneCodec;
use crate::rpc::AssetQuery;
use crate::signer::{LocalSigner, TransactionSigner};
use crate::supercluster::{plan_cluster, ParallelCoordinator};
use crate::transaction::{validate_chain_integrity, ChainAnchor, TransactionBuilder};
use crate::types::{AddressType, ContractId, TxKind};
use crate::verify::{ChainVerifier, VerifyConfig};
use crate::wallet::WalletPool;

const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const CONTRACT: ContractId = ContractId { block: 2, tx: 16 };

fn fast_broadcast() -> BroadcastConfig {
    BroadcastConfig {
        max_retries: 1,
        retry_delay_ms: 1,
        acceptance_timeout_ms: 200,
        acceptance_poll_interval_ms: 1,
        confirmation_timeout_ms: 200,
        mode: BroadcastMode::Auto,
    }
}

struct Harness {
    chain: MockChain,
    pool: Arc<WalletPool>,
    orders: Arc<OrderManager>,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self::with_max_attempts(3)
    }

    fn with_max_attempts(max_recovery_attempts: u32) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            chain: MockChain::new(),
            pool: Arc::new(WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap()),
            orders: Arc::new(OrderManager::with_max_recovery_attempts(store, max_recovery_attempts)),
            cancel: CancellationToken::new(),
        }
    }

    fn executor(&self) -> ChainExecutor {
        let broadcaster = Broadcaster::new(Arc::new(self.chain.clone()), fast_broadcast(), self.cancel.clone());
        ChainExecutor::new(
            self.pool.clone(),
            Arc::new(TransactionBuilder::new(Arc::new(RunestoneCodec))),
            Arc::new(LocalSigner::new()),
            Arc::new(broadcaster),
            Arc::new(self.chain.clone()),
            self.orders.clone(),
        )
    }

    fn verified_executor(&self) -> ChainExecutor {
        self.executor_verified_by(Arc::new(self.chain.clone()))
    }

    fn executor_verified_by(&self, assets: Arc<dyn AssetQuery>) -> ChainExecutor {
        let verifier = ChainVerifier::new(
            Arc::new(self.chain.clone()),
            assets,
            VerifyConfig {
                poll_interval_ms: 1,
                max_wait_time_ms: 2_000,
            },
        );
        self.executor().with_verifier(Arc::new(verifier))
    }

    /// Persist an order the way `start` does, without running it
    async fn abandoned(&self, request: MintRequest) -> Result<String> {
        let funding = self.pool.funding_wallet(request.execution_params.funding_address_type)?;
        let order = self
            .orders
            .create_order(NewOrder {
                contract_id: request.contract_id,
                final_receiver_address: request.final_receiver_address,
                funding_address: funding.address.to_string(),
                network: Network::Regtest,
                execution_mode: request.execution_mode,
                execution_params: request.execution_params,
            })
            .await?;
        Ok(order.id)
    }

    fn fund(&self, value: u64) {
        let funding = self.pool.funding_wallet(AddressType::Taproot).unwrap();
        self.chain.fund(&funding.address, value);
    }

    fn snowball(&self, mints: u32) -> MintRequest {
        MintRequest {
            contract_id: CONTRACT,
            final_receiver_address: self.chain.receiver_address().to_string(),
            execution_mode: ExecutionMode::Snowball,
            execution_params: ExecutionParams::snowball(2, mints, AddressType::Taproot),
        }
    }

    fn supercluster(&self, mints: u32) -> MintRequest {
        MintRequest {
            contract_id: CONTRACT,
            final_receiver_address: self.chain.receiver_address().to_string(),
            execution_mode: ExecutionMode::Supercluster,
            execution_params: ExecutionParams::supercluster(2, mints, AddressType::Taproot, 25, 4),
        }
    }
}

/// Indexer that has not seen any mint
struct EmptyIndexer;

#[async_trait]
impl AssetQuery for EmptyIndexer {
    async fn balance_of(&self, _address: &Address, _contract_id: ContractId) -> crate::error::Result<u128> {
        Ok(0)
    }
}

fn legacy_receiver() -> Address {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
    let public_key = bitcoin::PublicKey::new(secret.public_key(&secp));
    Address::p2pkh(public_key, Network::Regtest)
}

#[tokio::test]
async fn test_snowball_mints_every_child() -> Result<()> {
    let h = Harness::new();
    h.fund(100_000);
    h.chain.set_auto_mine(true);

    let order = h.verified_executor().start(h.snowball(24)).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.progress.completed_child_count, 24);
    assert!(order.progress.steps.iter().all(|s| s.state == StepState::Broadcast));
    assert_eq!(h.chain.accepted().len(), 25);
    assert_eq!(h.chain.token_balance(&h.chain.receiver_address()), 25);
    assert_eq!(order.progress.last_output_value, Some(330));
    assert_eq!(order.progress.receiver_baseline, Some(0));
    let check = order.progress.final_asset_balance.unwrap();
    assert!(check.verified);
    assert_eq!((check.expected, check.actual), (25, 25));
    Ok(())
}

#[tokio::test]
async fn test_short_balance_still_completes() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    h.chain.set_auto_mine(true);

    let order = h.executor_verified_by(Arc::new(EmptyIndexer)).start(h.snowball(5)).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert!(order.interrupt_info.is_none());
    let check = order.progress.final_asset_balance.unwrap();
    assert!(!check.verified);
    assert_eq!((check.expected, check.actual), (6, 0));
    assert_eq!(h.chain.token_balance(&h.chain.receiver_address()), 6);
    Ok(())
}

#[tokio::test]
async fn test_balance_is_judged_from_pre_send_holdings() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    h.chain.set_auto_mine(true);
    h.chain.grant_tokens(&h.chain.receiver_address(), 40);

    let order = h.verified_executor().start(h.snowball(5)).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.progress.receiver_baseline, Some(40));
    let check = order.progress.final_asset_balance.unwrap();
    assert_eq!(check.actual, 46);
    assert_eq!(check.minted(), 6);
    assert!(check.verified);
    Ok(())
}

#[tokio::test]
async fn test_sequential_waits_for_blocks() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    h.chain.set_unconfirmed_chaining(false);
    h.chain.set_auto_mine(true);

    let executor = h.verified_executor();
    assert_eq!(executor.broadcaster().effective_mode(), BroadcastMode::Sequential);
    let order = executor.start(h.snowball(5)).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(h.chain.token_balance(&h.chain.receiver_address()), 6);
    Ok(())
}

#[tokio::test]
async fn test_lost_responses_do_not_break_the_chain() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    h.chain.drop_next_responses(3);

    let order = h.executor().start(h.snowball(6)).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(h.chain.accepted().len(), 7);
    Ok(())
}

#[tokio::test]
async fn test_resume_reproduces_uninterrupted_txids() -> Result<()> {
    let reference = Harness::new();
    reference.fund(100_000);
    reference.executor().start(reference.snowball(10)).await?;
    let expected = reference.chain.accepted();

    let h = Harness::new();
    h.fund(100_000);
    h.chain.fail_after_accepted(4);
    let executor = h.executor();

    let err = executor.start(h.snowball(10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BroadcastError);
    let order = h.orders.list_orders().await?.remove(0);
    assert_eq!(order.status, OrderStatus::Interrupted);
    let info = order.interrupt_info.as_ref().unwrap();
    assert_eq!(info.error_kind, ErrorKind::BroadcastError);
    assert!(info.relay_balance.is_some());
    assert_eq!(h.chain.accepted().len(), 4);

    h.chain.heal();
    let resumed = executor.resume(&order.id).await?;

    assert_eq!(resumed.status, OrderStatus::Completed);
    assert_eq!(resumed.recovery_attempts(), 1);
    assert_eq!(h.chain.accepted(), expected);
    Ok(())
}

#[tokio::test]
async fn test_order_abandoned_before_running_resumes() -> Result<()> {
    let reference = Harness::new();
    reference.fund(100_000);
    reference.executor().start(reference.snowball(10)).await?;
    let expected = reference.chain.accepted();

    let h = Harness::new();
    h.fund(100_000);
    let id = h.abandoned(h.snowball(10)).await?;
    assert_eq!(h.orders.get_interrupted_orders().await?.len(), 1);

    let done = h.executor().resume(&id).await?;

    assert_eq!(done.status, OrderStatus::Completed);
    assert_eq!(done.recovery_attempts(), 0);
    assert_eq!(h.chain.accepted(), expected);
    assert!(h.orders.get_interrupted_orders().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_order_abandoned_mid_chain_resumes() -> Result<()> {
    let reference = Harness::new();
    reference.fund(100_000);
    reference.executor().start(reference.snowball(10)).await?;
    let expected = reference.chain.accepted();

    let h = Harness::new();
    h.fund(100_000);
    h.chain.fail_after_accepted(4);
    assert!(h.executor().start(h.snowball(10)).await.is_err());
    let id = h.orders.list_orders().await?.remove(0).id;
    // A resume that died before recording anything leaves the order running.
    let stale = h.orders.mark_resuming(&id).await?;
    assert_eq!(stale.status, OrderStatus::Executing);
    assert!(stale.progress.steps.iter().any(|s| s.state == StepState::Signed));

    h.chain.heal();
    let resumable = h.orders.get_interrupted_orders().await?;
    assert_eq!(resumable.len(), 1);
    let done = h.executor().resume(&resumable[0].id).await?;

    assert_eq!(done.status, OrderStatus::Completed);
    assert!(done.progress.steps.iter().all(|s| s.state == StepState::Broadcast));
    assert_eq!(h.chain.accepted(), expected);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_supercluster_resumes() -> Result<()> {
    let h = Harness::new();
    h.fund(200_000);
    let id = h.abandoned(h.supercluster(30)).await?;

    let done = ParallelCoordinator::new(h.executor()).resume(&id).await?;

    assert_eq!(done.status, OrderStatus::Completed);
    assert_eq!(done.progress.slices.len(), 2);
    assert!(done.progress.slices.iter().all(|s| s.status == SliceStatus::Completed));
    assert_eq!(h.chain.token_balance(&h.chain.receiver_address()), 31);
    Ok(())
}

#[tokio::test]
async fn test_interrupt_reset_resume() -> Result<()> {
    let h = Harness::new();
    h.fund(100_000);
    h.chain.fail_after_accepted(3);
    let executor = h.executor();

    assert!(executor.start(h.snowball(8)).await.is_err());
    let interrupted = h.orders.list_orders().await?.remove(0);
    assert_eq!(interrupted.status, OrderStatus::Interrupted);

    let reset = h.orders.reset_order_to_interrupted(&interrupted.id).await?;
    assert_eq!(reset.status, OrderStatus::Interrupted);
    assert_eq!(reset.recovery_attempts(), 0);

    h.chain.heal();
    let done = executor.resume(&interrupted.id).await?;
    assert_eq!(done.status, OrderStatus::Completed);
    assert_eq!(done.relay_wallet_index, interrupted.relay_wallet_index);
    assert_eq!(done.recovery_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reset_keeps_relay_wallet() -> Result<()> {
    let h = Harness::with_max_attempts(1);
    h.fund(100_000);
    h.chain.fail_after_accepted(3);
    let executor = h.executor();

    assert!(executor.start(h.snowball(8)).await.is_err());
    let id = h.orders.list_orders().await?.remove(0).id;
    let relay_index = h.orders.get_order(&id).await?.unwrap().relay_wallet_index;

    assert!(executor.resume(&id).await.is_err());
    assert_eq!(h.orders.get_order(&id).await?.unwrap().status, OrderStatus::Interrupted);

    let exhausted = executor.resume(&id).await?;
    assert_eq!(exhausted.status, OrderStatus::RecoveryFailed);

    let reset = h.orders.reset_order_to_interrupted(&id).await?;
    assert_eq!(reset.status, OrderStatus::Interrupted);
    assert_eq!(reset.recovery_attempts(), 0);

    h.chain.heal();
    let done = executor.resume(&id).await?;
    assert_eq!(done.status, OrderStatus::Completed);
    assert_eq!(done.relay_wallet_index, relay_index);

    let relay = h.pool.relay_wallet(relay_index.unwrap())?;
    let child = done.progress.steps.iter().find(|s| s.kind == TxKind::Child && s.index == 1).unwrap();
    let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize_hex(&child.raw_tx)?;
    assert_eq!(tx.output[0].script_pubkey, relay.address.script_pubkey());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_signing() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    h.cancel.cancel();

    let err = h.executor().start(h.snowball(3)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(h.chain.accepted().is_empty());
    let order = h.orders.list_orders().await?.remove(0);
    assert_eq!(order.status, OrderStatus::Interrupted);
    assert_eq!(order.interrupt_info.unwrap().error_kind, ErrorKind::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_insufficient_funds_creates_nothing() -> Result<()> {
    let h = Harness::new();
    h.fund(1_000);

    let err = h.executor().start(h.snowball(24)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert!(h.orders.list_orders().await?.is_empty());
    assert!(h.chain.accepted().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_supercluster_mode_rejected_by_executor() {
    let h = Harness::new();
    h.fund(100_000);
    let err = h.executor().start(h.supercluster(30)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[test]
fn test_dust_output_to_legacy_receiver() {
    let pool = WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap();
    let wallets = pool.chain_wallets(AddressType::Taproot, 0, legacy_receiver()).unwrap();
    let builder = TransactionBuilder::new(Arc::new(RunestoneCodec));
    let chain = MockChain::new();
    let parent = chain.fund_dummy_tx(10_000);

    let err = builder
        .build_child(parent.txid, 900, 1, true, &wallets, CONTRACT, 800)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionBuildError);
    assert!(err.to_string().contains("546"));

    let mut fees = fee::calculate_fees(2, 1, AddressType::Legacy).unwrap();
    fees.relay_fuel_amount = 100;
    let funding = pool.funding_wallet(AddressType::Taproot).unwrap();
    let utxo = chain.fund(&funding.address, 50_000);
    let err = builder.build_parent(&wallets, CONTRACT, &fees, &[utxo]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DustThresholdViolation);
    assert!(chain.accepted().is_empty());
}

#[tokio::test]
async fn test_legacy_receiver_final_child_clears_dust() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    let mut request = h.snowball(3);
    request.final_receiver_address = legacy_receiver().to_string();

    let order = h.executor().start(request).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.progress.last_output_value, Some(546));
    assert_eq!(h.chain.token_balance(&legacy_receiver()), 4);
    Ok(())
}

#[tokio::test]
async fn test_broadcast_chain_keeps_order() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    let receiver = h.chain.receiver_address();
    let wallets = h.pool.chain_wallets(AddressType::Taproot, 0, receiver)?;
    let fees = fee::calculate_fees(2, 4, AddressType::Taproot)?;
    let builder = TransactionBuilder::new(Arc::new(RunestoneCodec));
    let utxos = crate::rpc::UtxoSource::list_spendable(&h.chain, &wallets.funding.address).await?;

    let parent = builder.build_parent(&wallets, CONTRACT, &fees, &utxos)?;
    let children = builder.build_child_chain(
        ChainAnchor::relay_of(&parent),
        1,
        4,
        &wallets,
        CONTRACT,
        fees.child_tx.total_fee,
        None,
    )?;
    let mut all = vec![parent.clone()];
    all.extend(children.iter().cloned());
    assert!(validate_chain_integrity(&all).is_valid);

    let signer = LocalSigner::new();
    let signed_parent = signer.sign(&parent, &wallets.funding)?;
    let signed_children = children
        .iter()
        .map(|c| signer.sign(c, &wallets.relay))
        .collect::<crate::error::Result<Vec<_>>>()?;

    let broadcaster = Broadcaster::new(Arc::new(h.chain.clone()), fast_broadcast(), CancellationToken::new());
    let results = broadcaster.broadcast_chain(&signed_parent, &signed_children).await?;

    assert!(results.iter().all(|r| r.success));
    let expected: Vec<_> = all.iter().map(|b| b.expected_txid).collect();
    assert_eq!(h.chain.accepted(), expected);
    Ok(())
}

#[tokio::test]
async fn test_supercluster_partial_then_resume() -> Result<()> {
    let h = Harness::new();
    h.fund(200_000);
    let stalled = h.pool.relay_wallet(3000)?;
    h.chain.reject_spends_from(stalled.address.script_pubkey());
    let coordinator = ParallelCoordinator::new(h.executor());

    let order = coordinator.start(h.supercluster(77)).await?;

    assert_eq!(order.status, OrderStatus::PartialCompleted);
    assert_eq!(order.relay_wallet_index, Some(0));
    let slices = &order.progress.slices;
    assert_eq!(slices.iter().map(|s| s.mint_count).collect::<Vec<_>>(), vec![25, 25, 25, 2]);
    assert_eq!(slices[3].relay_derivation_index, 3000);
    assert_eq!(slices[3].status, SliceStatus::Failed);
    assert!(slices[3].error.is_some());
    assert!(slices[..3].iter().all(|s| s.status == SliceStatus::Completed));
    assert_eq!(order.progress.completed_child_count, 75);
    let receiver = h.chain.receiver_address();
    assert_eq!(h.chain.token_balance(&receiver), 76);

    let recoverable = h.orders.get_recoverable_slices(&order.id).await?;
    assert_eq!(recoverable.len(), 1);

    h.chain.heal();
    let before = h.chain.accepted().len();
    let done = coordinator.resume(&order.id).await?;

    assert_eq!(done.status, OrderStatus::Completed);
    assert_eq!(h.chain.accepted().len(), before + 2);
    assert_eq!(h.chain.token_balance(&receiver), 78);
    assert!(h.orders.get_interrupted_orders().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_every_slice_failing_interrupts() -> Result<()> {
    let h = Harness::new();
    h.fund(200_000);
    for index in [0, 1000] {
        h.chain.reject_spends_from(h.pool.relay_wallet(index)?.address.script_pubkey());
    }
    let coordinator = ParallelCoordinator::new(h.executor());

    assert!(coordinator.start(h.supercluster(30)).await.is_err());

    let order = h.orders.list_orders().await?.remove(0);
    assert_eq!(order.status, OrderStatus::Interrupted);
    let plan = plan_cluster(&order.execution_params, AddressType::Taproot)?;
    let info = order.interrupt_info.unwrap();
    assert_eq!(info.relay_balance, Some(plan.slice_values.iter().sum::<u64>()));
    assert_eq!(info.error_kind, ErrorKind::BroadcastError);
    Ok(())
}

#[tokio::test]
async fn test_supercluster_cpfp_first_child() -> Result<()> {
    let h = Harness::new();
    h.fund(200_000);
    let mut request = h.supercluster(30);
    request.execution_params.cpfp = Some(CpfpParams {
        package_fee_rate: 20,
        confirmation_timeout_ms: 20,
    });
    let plan = plan_cluster(&request.execution_params, AddressType::Taproot)?;

    let order = ParallelCoordinator::new(h.executor()).start(request).await?;

    assert_eq!(order.status, OrderStatus::Completed);
    let first = order.progress.slices[0]
        .steps
        .iter()
        .find(|s| s.index == 1)
        .unwrap();
    assert_eq!(Some(first.fee), plan.cpfp_child_fee);
    assert!(first.fee > plan.child_fee.total_fee);
    assert_eq!(h.chain.token_balance(&h.chain.receiver_address()), 31);
    Ok(())
}

#[tokio::test]
async fn test_resume_rejects_completed_order() -> Result<()> {
    let h = Harness::new();
    h.fund(50_000);
    let executor = h.executor();
    let order = executor.start(h.snowball(2)).await?;

    let err = executor.resume(&order.id).await.unwrap_err();
    assert!(matches!(err, SnowballError::Validation(_)));
    Ok(())
}
