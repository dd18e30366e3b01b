//! Test utilities and end-to-end scenarios
//!
//! This module provides:
//! - An in-memory chain that stands in for the node and the asset indexer
//! - Order scenarios driven through the executor and the parallel coordinator

pub mod mock_chain;

mod chain_scenarios;
