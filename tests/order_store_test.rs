use anyhow::Result;
use bitcoin::Network;
use chrono::Utc;
use std::sync::Arc;

use snowball::order::manager::NewOrder;
use snowball::order::{
    ChainStep, ExecutionMode, ExecutionParams, FilesystemStore, KvStore, OrderManager, OrderStatus, StepState,
};
use snowball::types::{AddressType, ContractId, TxKind};
use snowball::ErrorKind;

fn new_order(mode: ExecutionMode, total_mints: u32) -> NewOrder {
    let execution_params = match mode {
        ExecutionMode::Snowball => ExecutionParams::snowball(5, total_mints, AddressType::Taproot),
        ExecutionMode::Supercluster => ExecutionParams::supercluster(5, total_mints, AddressType::Taproot, 25, 4),
    };
    NewOrder {
        contract_id: ContractId::new(2, 16),
        final_receiver_address: "bcrt1p8wpt9v4frpf3tkn0srd97pksgsxc5hs52lafxwru9kgeephvs7rqjeprhg".to_string(),
        funding_address: "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080".to_string(),
        network: Network::Regtest,
        execution_mode: mode,
        execution_params,
    }
}

fn parent_step() -> ChainStep {
    ChainStep {
        kind: TxKind::Parent,
        index: 0,
        txid: "4d3c1f9a2b8e7d6c5b4a39281706f5e4d3c2b1a09f8e7d6c5b4a392817061f0e".parse().unwrap(),
        output_value: 5_000,
        fee: 995,
        raw_tx: "00".to_string(),
        state: StepState::Signed,
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_orders_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let id = {
        let orders = OrderManager::new(Arc::new(FilesystemStore::new(dir.path())));
        let order = orders.create_order(new_order(ExecutionMode::Snowball, 10)).await?;
        orders.record_step(&order.id, None, parent_step()).await?;
        order.id
    };

    let orders = OrderManager::new(Arc::new(FilesystemStore::new(dir.path())));
    let order = orders.get_order(&id).await?.expect("order persisted");
    assert_eq!(order.status, OrderStatus::Executing);
    assert_eq!(order.relay_wallet_index, Some(0));
    assert_eq!(order.progress.steps.len(), 1);
    assert_eq!(order.progress.steps[0].state, StepState::Signed);

    let next = orders.create_order(new_order(ExecutionMode::Snowball, 3)).await?;
    assert_eq!(next.relay_wallet_index, Some(1));
    Ok(())
}

#[tokio::test]
async fn test_interrupted_orders_listed_across_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FilesystemStore::new(dir.path()));
    let orders = OrderManager::new(store.clone());

    let done = orders.create_order(new_order(ExecutionMode::Snowball, 2)).await?;
    let stalled = orders.create_order(new_order(ExecutionMode::Supercluster, 60)).await?;
    orders.mark_completed(&done.id).await?;
    orders
        .mark_interrupted(&stalled.id, "node unreachable", ErrorKind::NetworkError, Some(12_345))
        .await?;

    let reopened = OrderManager::new(Arc::new(FilesystemStore::new(dir.path())));
    let interrupted = reopened.get_interrupted_orders().await?;
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].id, stalled.id);
    let info = interrupted[0].interrupt_info.as_ref().unwrap();
    assert_eq!(info.error_kind, ErrorKind::NetworkError);
    assert_eq!(info.relay_balance, Some(12_345));

    assert_eq!(reopened.list_orders().await?.len(), 2);
    assert!(store.get("index/active_orders").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_completed_order_cannot_be_interrupted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let orders = OrderManager::new(Arc::new(FilesystemStore::new(dir.path())));
    let order = orders.create_order(new_order(ExecutionMode::Snowball, 2)).await?;
    orders.mark_completed(&order.id).await?;

    let err = orders
        .mark_interrupted(&order.id, "late failure", ErrorKind::BroadcastError, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    Ok(())
}
