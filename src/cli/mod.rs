//! Command-line interface for snowball
//!
//! This module provides the CLI functionality for:
//! - Creating snowball and supercluster mint orders
//! - Resuming interrupted orders, one or all
//! - Inspecting, listing and resetting persisted orders
//! - Estimating the funding an order needs

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::broadcast::{BroadcastMode, Broadcaster, CancellationToken};
use crate::chain::{ChainExecutor, MintRequest};
use crate::config::{default_data_dir, expand_tilde, store_dir, AppConfig};
use crate::fee;
use crate::order::{
    CpfpParams, ExecutionMode, ExecutionParams, FilesystemStore, Order, OrderManager, OrderStatus,
};
use crate::protostone::RunestoneCodec;
use crate::rpc::{EsploraClient, MetashrewClient};
use crate::signer::LocalSigner;
use crate::supercluster::{plan_cluster, ParallelCoordinator};
use crate::transaction::TransactionBuilder;
use crate::types::{AddressType, ContractId};
use crate::verify::ChainVerifier;
use crate::wallet::WalletPool;

/// Environment variable holding the mnemonic when no file is given
pub const MNEMONIC_ENV: &str = "SNOWBALL_MNEMONIC";

/// Main CLI arguments
#[derive(Parser, Debug)]
#[command(name = "snowball")]
#[command(about = "Chained alkanes mint orchestration")]
#[command(version)]
pub struct Args {
    /// Data directory holding config.json and the order store
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Network (overrides config): mainnet, testnet, signet, regtest
    #[arg(short = 'n', long)]
    pub network: Option<String>,

    /// Esplora REST URL (overrides config)
    #[arg(long)]
    pub esplora_url: Option<String>,

    /// Metashrew JSON-RPC URL (overrides config)
    #[arg(long)]
    pub metashrew_url: Option<String>,

    /// File containing the BIP39 mnemonic; falls back to SNOWBALL_MNEMONIC
    #[arg(long)]
    pub mnemonic_file: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FundingTypeArg {
    Taproot,
    NativeSegwit,
}

impl From<FundingTypeArg> for AddressType {
    fn from(arg: FundingTypeArg) -> Self {
        match arg {
            FundingTypeArg::Taproot => AddressType::Taproot,
            FundingTypeArg::NativeSegwit => AddressType::NativeSegwit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReceiverTypeArg {
    Taproot,
    NativeSegwit,
    NestedSegwit,
    Legacy,
}

impl From<ReceiverTypeArg> for AddressType {
    fn from(arg: ReceiverTypeArg) -> Self {
        match arg {
            ReceiverTypeArg::Taproot => AddressType::Taproot,
            ReceiverTypeArg::NativeSegwit => AddressType::NativeSegwit,
            ReceiverTypeArg::NestedSegwit => AddressType::NestedSegwit,
            ReceiverTypeArg::Legacy => AddressType::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Snowball,
    Supercluster,
}

impl From<ModeArg> for ExecutionMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Snowball => ExecutionMode::Snowball,
            ModeArg::Supercluster => ExecutionMode::Supercluster,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BroadcastModeArg {
    Sequential,
    Parallel,
    Auto,
}

impl From<BroadcastModeArg> for BroadcastMode {
    fn from(arg: BroadcastModeArg) -> Self {
        match arg {
            BroadcastModeArg::Sequential => BroadcastMode::Sequential,
            BroadcastModeArg::Parallel => BroadcastMode::Parallel,
            BroadcastModeArg::Auto => BroadcastMode::Auto,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default config.json into the data directory
    Init,
    /// Create a mint order and run it
    CreateOrder {
        /// Alkanes contract as block:tx
        #[arg(long)]
        contract: String,
        /// Address receiving the minted tokens
        #[arg(long)]
        receiver: String,
        /// Number of mint children
        #[arg(long)]
        mints: u32,
        /// Fee rate in sat/vB (defaults to the node's estimate)
        #[arg(long)]
        fee_rate: Option<u64>,
        #[arg(long, value_enum, default_value = "taproot")]
        funding_type: FundingTypeArg,
        #[arg(long, value_enum, default_value = "snowball")]
        mode: ModeArg,
        /// Children per slice (supercluster)
        #[arg(long)]
        mints_per_slice: Option<u32>,
        /// Slices running at once (supercluster)
        #[arg(long)]
        max_concurrent_slices: Option<usize>,
        /// Package fee rate for CPFP acceleration of the composite parent (supercluster)
        #[arg(long)]
        cpfp_fee_rate: Option<u64>,
        /// How long to wait for the CPFP package to confirm
        #[arg(long, default_value = "600000")]
        cpfp_timeout_ms: u64,
        #[arg(long, value_enum)]
        broadcast_mode: Option<BroadcastModeArg>,
        /// Complete once every step is accepted, without waiting for confirmations
        #[arg(long)]
        no_verify: bool,
    },
    /// Resume an interrupted or partially completed order
    Resume {
        id: String,
        #[arg(long)]
        no_verify: bool,
    },
    /// Resume every resumable order
    ResumeAll {
        #[arg(long)]
        no_verify: bool,
    },
    /// Show one order, or every active order
    Status {
        id: Option<String>,
        /// Print the raw JSON record
        #[arg(long)]
        raw: bool,
    },
    /// List all stored orders
    List,
    /// Move a RECOVERY_FAILED order back to INTERRUPTED
    Reset { id: String },
    /// Show the fees and funding an order would need
    Estimate {
        #[arg(long)]
        mints: u32,
        #[arg(long)]
        fee_rate: u64,
        #[arg(long, value_enum, default_value = "taproot")]
        receiver_type: ReceiverTypeArg,
        #[arg(long, value_enum, default_value = "taproot")]
        funding_type: FundingTypeArg,
        #[arg(long, value_enum, default_value = "snowball")]
        mode: ModeArg,
        #[arg(long, default_value = "25")]
        mints_per_slice: u32,
    },
}

/// Process exit code for an order's final status
pub fn exit_code(status: OrderStatus) -> i32 {
    match status {
        OrderStatus::Completed => 0,
        OrderStatus::RecoveryFailed => 2,
        _ => 1,
    }
}

fn status_icon(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Completed => "✅",
        OrderStatus::Executing | OrderStatus::ParallelExecuting => "⏳",
        OrderStatus::Interrupted | OrderStatus::PartialCompleted => "⚠️",
        OrderStatus::RecoveryFailed => "❌",
    }
}

fn print_order(order: &Order) {
    println!("{} Order {} [{}]", status_icon(order.status), order.id, order.status);
    println!("   Mode:      {}", order.execution_mode);
    println!("   Contract:  {}", order.contract_id);
    println!("   Receiver:  {}", order.final_receiver_address);
    println!(
        "   Progress:  {}/{} children",
        order.progress.completed_child_count, order.execution_params.total_mints
    );
    if let Some(txid) = order.progress.parent_txid {
        println!("   Parent:    {}", txid);
    }
    if let Some(txid) = order.progress.last_txid {
        println!("   Last tx:   {}", txid);
    }
    for slice in &order.progress.slices {
        println!(
            "   Slice {:>3}: {:?} {}/{} via {}",
            slice.slice_index, slice.status, slice.completed_child_txs, slice.mint_count, slice.relay_address
        );
    }
    if let Some(check) = &order.progress.final_asset_balance {
        println!(
            "   Balance:   {} {} (+{} of {} expected)",
            if check.verified { "✅" } else { "⚠️" },
            check.actual,
            check.minted(),
            check.expected
        );
    }
    if let Some(info) = &order.interrupt_info {
        println!("   Interrupt: {} ({})", info.reason, info.error_kind);
    }
    if order.recovery_attempts() > 0 {
        println!("   Recovery attempts: {}", order.recovery_attempts());
    }
}

fn read_mnemonic(mnemonic_file: Option<&str>) -> Result<String> {
    if let Some(path) = mnemonic_file {
        let path = expand_tilde(path);
        return std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read mnemonic from {}", path.display()));
    }
    std::env::var(MNEMONIC_ENV).map_err(|_| anyhow!("No mnemonic: pass --mnemonic-file or set {}", MNEMONIC_ENV))
}

/// Everything commands that touch the chain need
struct Runtime {
    executor: ChainExecutor,
    coordinator: ParallelCoordinator,
    esplora: Arc<EsploraClient>,
}

impl Runtime {
    async fn resume(&self, order: &Order) -> crate::error::Result<Order> {
        match order.execution_mode {
            ExecutionMode::Snowball => self.executor.resume(&order.id).await,
            ExecutionMode::Supercluster => self.coordinator.resume(&order.id).await,
        }
    }
}

pub struct Cli {
    args: Args,
    data_dir: PathBuf,
    config: AppConfig,
}

impl Cli {
    pub fn new(args: Args) -> Result<Self> {
        let data_dir = args
            .data_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_data_dir);
        let mut config = AppConfig::load(&data_dir)?;
        if let Some(network) = &args.network {
            config.network = network.clone();
        }
        if let Some(url) = &args.esplora_url {
            config.rpc.esplora_url = url.clone();
        }
        if let Some(url) = &args.metashrew_url {
            config.rpc.metashrew_url = url.clone();
        }
        Ok(Self { args, data_dir, config })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn order_manager(&self) -> Arc<OrderManager> {
        let store = Arc::new(FilesystemStore::new(store_dir(&self.data_dir)));
        Arc::new(OrderManager::with_max_recovery_attempts(
            store,
            self.config.max_recovery_attempts,
        ))
    }

    fn runtime(&self, broadcast_mode: Option<BroadcastMode>, verify: bool) -> Result<Runtime> {
        let network = self.config.network()?;
        let mnemonic = read_mnemonic(self.args.mnemonic_file.as_deref())?;
        let pool = Arc::new(WalletPool::from_mnemonic(&mnemonic, network)?);

        let esplora = Arc::new(EsploraClient::new(&self.config.rpc)?);
        let mut broadcast_config = self.config.broadcast.clone();
        if let Some(mode) = broadcast_mode {
            broadcast_config.mode = mode;
        }

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; no further transactions will be submitted");
                on_signal.cancel();
            }
        });

        let broadcaster = Arc::new(Broadcaster::new(esplora.clone(), broadcast_config, cancel));
        let builder = Arc::new(TransactionBuilder::new(Arc::new(RunestoneCodec)));
        let mut executor = ChainExecutor::new(
            pool,
            builder,
            Arc::new(LocalSigner::new()),
            broadcaster,
            esplora.clone(),
            self.order_manager(),
        );
        if verify {
            let metashrew = Arc::new(MetashrewClient::new(&self.config.rpc)?);
            executor = executor.with_verifier(Arc::new(ChainVerifier::new(
                esplora.clone(),
                metashrew,
                self.config.verify.clone(),
            )));
        }
        Ok(Runtime {
            coordinator: ParallelCoordinator::new(executor.clone()),
            executor,
            esplora,
        })
    }

    /// Run the selected command and return the process exit code
    pub async fn run(&self) -> Result<i32> {
        match &self.args.command {
            Commands::Init => {
                self.config.save(&self.data_dir)?;
                println!("✅ Wrote {}", self.data_dir.join(crate::config::CONFIG_FILE).display());
                Ok(0)
            }
            Commands::CreateOrder {
                contract,
                receiver,
                mints,
                fee_rate,
                funding_type,
                mode,
                mints_per_slice,
                max_concurrent_slices,
                cpfp_fee_rate,
                cpfp_timeout_ms,
                broadcast_mode,
                no_verify,
            } => {
                let runtime = self.runtime(broadcast_mode.map(Into::into), !no_verify)?;
                let contract_id: ContractId = contract.parse()?;
                let fee_rate = match fee_rate {
                    Some(rate) => *rate,
                    None => self.estimated_fee_rate(&runtime).await,
                };
                let defaults = &self.config.defaults;
                let mut params = ExecutionParams::supercluster(
                    fee_rate,
                    *mints,
                    (*funding_type).into(),
                    mints_per_slice.unwrap_or(defaults.mints_per_slice),
                    max_concurrent_slices.unwrap_or(defaults.max_concurrent_slices),
                );
                params.cpfp = cpfp_fee_rate.map(|rate| CpfpParams {
                    package_fee_rate: rate,
                    confirmation_timeout_ms: *cpfp_timeout_ms,
                });

                let request = MintRequest {
                    contract_id,
                    final_receiver_address: receiver.clone(),
                    execution_mode: (*mode).into(),
                    execution_params: params,
                };
                info!("Creating {:?} order for {} mints of {}", mode, mints, contract_id);
                let result = match request.execution_mode {
                    ExecutionMode::Snowball => runtime.executor.start(request).await,
                    ExecutionMode::Supercluster => runtime.coordinator.start(request).await,
                };
                match result {
                    Ok(order) => {
                        print_order(&order);
                        Ok(exit_code(order.status))
                    }
                    Err(e) => {
                        println!("❌ Order failed ({}): {}", e.kind(), e);
                        Ok(1)
                    }
                }
            }
            Commands::Resume { id, no_verify } => {
                let runtime = self.runtime(None, !no_verify)?;
                let order = runtime
                    .executor
                    .orders()
                    .get_order(id)
                    .await?
                    .ok_or_else(|| anyhow!("Order {} not found", id))?;
                self.resume_one(&runtime, &order).await
            }
            Commands::ResumeAll { no_verify } => {
                let runtime = self.runtime(None, !no_verify)?;
                let orders = runtime.executor.orders().get_interrupted_orders().await?;
                if orders.is_empty() {
                    println!("✅ No resumable orders");
                    return Ok(0);
                }
                let mut code = 0;
                for order in &orders {
                    let order_code = self.resume_one(&runtime, order).await?;
                    code = match (code, order_code) {
                        (2, _) | (_, 2) => 2,
                        (0, c) => c,
                        (c, _) => c,
                    };
                }
                Ok(code)
            }
            Commands::Status { id, raw } => {
                let orders = self.order_manager();
                let selected = match id {
                    Some(id) => vec![orders
                        .get_order(id)
                        .await?
                        .ok_or_else(|| anyhow!("Order {} not found", id))?],
                    None => orders
                        .list_orders()
                        .await?
                        .into_iter()
                        .filter(|o| !o.status.is_terminal())
                        .collect(),
                };
                if selected.is_empty() {
                    println!("No active orders");
                }
                for order in &selected {
                    if *raw {
                        println!("{}", serde_json::to_string_pretty(order)?);
                    } else {
                        print_order(order);
                    }
                }
                Ok(match (id, selected.first()) {
                    (Some(_), Some(order)) => exit_code(order.status),
                    _ => 0,
                })
            }
            Commands::List => {
                let orders = self.order_manager().list_orders().await?;
                println!("{:<32} {:<18} {:<13} {:>7}  CREATED", "ID", "STATUS", "MODE", "MINTS");
                for order in &orders {
                    println!(
                        "{:<32} {:<18} {:<13} {:>7}  {}",
                        order.id,
                        order.status.to_string(),
                        order.execution_mode.to_string(),
                        order.execution_params.total_mints,
                        order.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                Ok(0)
            }
            Commands::Reset { id } => {
                let order = self.order_manager().reset_order_to_interrupted(id).await?;
                println!("✅ Order {} reset to {}", order.id, order.status);
                Ok(0)
            }
            Commands::Estimate {
                mints,
                fee_rate,
                receiver_type,
                funding_type,
                mode,
                mints_per_slice,
            } => {
                let receiver_type: AddressType = (*receiver_type).into();
                match ExecutionMode::from(*mode) {
                    ExecutionMode::Snowball => {
                        let fees = fee::calculate_fees(*fee_rate, *mints, receiver_type)?;
                        println!("💰 Snowball of {} children at {} sat/vB", mints, fee_rate);
                        println!("   Parent fee:      {} sats ({} vB)", fees.parent_tx.total_fee, fees.parent_tx.virtual_size);
                        println!("   Child fee:       {} sats ({} vB)", fees.child_tx.total_fee, fees.child_tx.virtual_size);
                        println!("   Relay fuel:      {} sats", fees.relay_fuel_amount);
                        println!("   Safety buffer:   {} sats", fees.safety_buffer);
                        println!("   Total required:  {} sats", fees.total_required_funding);
                    }
                    ExecutionMode::Supercluster => {
                        let params = ExecutionParams::supercluster(
                            *fee_rate,
                            *mints,
                            (*funding_type).into(),
                            *mints_per_slice,
                            self.config.defaults.max_concurrent_slices,
                        );
                        let plan = plan_cluster(&params, receiver_type)?;
                        println!(
                            "💰 Supercluster of {} children in {} slices at {} sat/vB",
                            mints,
                            plan.slice_mints.len(),
                            fee_rate
                        );
                        println!("   Composite parent: {} sats ({} vB)", plan.parent_fee, plan.parent_vsize);
                        for (i, (count, value)) in plan.slice_mints.iter().zip(&plan.slice_values).enumerate() {
                            println!("   Slice {:>3}:        {} children, {} sats", i, count, value);
                        }
                        println!("   Total required:   {} sats", plan.total_required_funding);
                    }
                }
                Ok(0)
            }
        }
    }

    async fn estimated_fee_rate(&self, runtime: &Runtime) -> u64 {
        let fallback = self.config.defaults.fee_rate;
        match runtime
            .esplora
            .recommended_fee_rate(self.config.defaults.confirmation_target)
            .await
        {
            Ok(rate) => {
                info!("Using estimated fee rate of {} sat/vB", rate);
                rate
            }
            Err(e) => {
                warn!("Fee estimate unavailable ({}), using {} sat/vB", e, fallback);
                fallback
            }
        }
    }

    async fn resume_one(&self, runtime: &Runtime, order: &Order) -> Result<i32> {
        println!("🔄 Resuming {} ({})", order.id, order.status);
        match runtime.resume(order).await {
            Ok(order) => {
                print_order(&order);
                Ok(exit_code(order.status))
            }
            Err(e) => {
                println!("❌ Resume of {} failed ({}): {}", order.id, e.kind(), e);
                let status = runtime
                    .executor
                    .orders()
                    .get_order(&order.id)
                    .await?
                    .map(|o| o.status)
                    .unwrap_or(OrderStatus::Interrupted);
                Ok(exit_code(status))
            }
        }
    }
}
