//! Snowball: build, broadcast and recover chained alkanes mint transactions
//!
//! A chain is a parent transaction funding a relay output, followed by child
//! transactions that each spend the previous relay output, carry a mint
//! protostone and forward the minted asset. Orders persist every signed step
//! so an interrupted chain resumes with exactly the txids it would have had.

pub mod broadcast;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod fee;
pub mod order;
pub mod protostone;
pub mod rpc;
pub mod signer;
pub mod supercluster;
pub mod transaction;
pub mod types;
pub mod verify;
pub mod wallet;

#[cfg(test)]
pub mod tests;

pub use broadcast::{BroadcastConfig, BroadcastMode, BroadcastResult, Broadcaster, CancellationToken};
pub use chain::{ChainExecutor, MintRequest};
pub use error::{ErrorKind, Result, SnowballError};
pub use fee::{calculate_fees, FeeCalculation};
pub use order::{ExecutionMode, ExecutionParams, Order, OrderManager, OrderStatus};
pub use supercluster::{plan_slices, ParallelCoordinator};
pub use transaction::{validate_chain_integrity, TransactionBuilder};
pub use types::{AddressType, BuiltTransaction, ContractId};
pub use wallet::WalletPool;
