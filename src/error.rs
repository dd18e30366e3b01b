//! Error taxonomy for chain minting
//!
//! Every failure carries a kind so the order manager can record it verbatim
//! and decide whether a step may be retried or the order has to halt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AddressType;

/// Result type for snowball operations
pub type Result<T> = std::result::Result<T, SnowballError>;

/// Error kinds as persisted in order interrupt records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientFunds,
    InvalidAddressType,
    DustThresholdViolation,
    FeeCalculationError,
    TransactionBuildError,
    SigningError,
    BroadcastError,
    ValidationError,
    ChainIntegrityError,
    AssetBalanceError,
    NetworkError,
    TimeoutError,
    StorageError,
    Cancelled,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::InvalidAddressType => "INVALID_ADDRESS_TYPE",
            ErrorKind::DustThresholdViolation => "DUST_THRESHOLD_VIOLATION",
            ErrorKind::FeeCalculationError => "FEE_CALCULATION_ERROR",
            ErrorKind::TransactionBuildError => "TRANSACTION_BUILD_ERROR",
            ErrorKind::SigningError => "SIGNING_ERROR",
            ErrorKind::BroadcastError => "BROADCAST_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ChainIntegrityError => "CHAIN_INTEGRITY_ERROR",
            ErrorKind::AssetBalanceError => "ASSET_BALANCE_ERROR",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Error type for snowball operations
#[derive(Debug, Error)]
pub enum SnowballError {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("Invalid address type: {0}")]
    InvalidAddressType(String),
    #[error("Dust threshold violation: {value} sats is below the {threshold} sat floor for {address_type} outputs")]
    DustThresholdViolation {
        value: u64,
        threshold: u64,
        address_type: AddressType,
    },
    #[error("Fee calculation error: {0}")]
    FeeCalculation(String),
    #[error("Transaction build error: {0}")]
    TransactionBuild(String),
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Broadcast error: {0}")]
    Broadcast(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Chain integrity error: {0}")]
    ChainIntegrity(String),
    #[error("Asset balance error: {0}")]
    AssetBalance(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl SnowballError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnowballError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            SnowballError::InvalidAddressType(_) => ErrorKind::InvalidAddressType,
            SnowballError::DustThresholdViolation { .. } => ErrorKind::DustThresholdViolation,
            SnowballError::FeeCalculation(_) => ErrorKind::FeeCalculationError,
            SnowballError::TransactionBuild(_) => ErrorKind::TransactionBuildError,
            SnowballError::Signing(_) => ErrorKind::SigningError,
            SnowballError::Broadcast(_) => ErrorKind::BroadcastError,
            SnowballError::Validation(_) => ErrorKind::ValidationError,
            SnowballError::ChainIntegrity(_) => ErrorKind::ChainIntegrityError,
            SnowballError::AssetBalance(_) => ErrorKind::AssetBalanceError,
            SnowballError::Network(_) => ErrorKind::NetworkError,
            SnowballError::Timeout(_) => ErrorKind::TimeoutError,
            SnowballError::Storage(_) => ErrorKind::StorageError,
            SnowballError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Transient failures that a local retry loop may attempt again.
    ///
    /// Structural failures (dust, integrity, id mismatch) are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NetworkError | ErrorKind::BroadcastError)
    }
}

impl From<serde_json::Error> for SnowballError {
    fn from(err: serde_json::Error) -> Self {
        SnowballError::Storage(format!("serialization failed: {}", err))
    }
}

impl From<std::io::Error> for SnowballError {
    fn from(err: std::io::Error) -> Self {
        SnowballError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SnowballError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SnowballError::Timeout(err.to_string())
        } else {
            SnowballError::Network(err.to_string())
        }
    }
}

impl From<bitcoin::address::ParseError> for SnowballError {
    fn from(err: bitcoin::address::ParseError) -> Self {
        SnowballError::Validation(format!("invalid address: {}", err))
    }
}

impl From<bitcoin::sighash::TaprootError> for SnowballError {
    fn from(err: bitcoin::sighash::TaprootError) -> Self {
        SnowballError::Signing(err.to_string())
    }
}

impl From<bitcoin::sighash::P2wpkhError> for SnowballError {
    fn from(err: bitcoin::sighash::P2wpkhError) -> Self {
        SnowballError::Signing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SnowballError::Network("reset".into()).is_retryable());
        assert!(SnowballError::Broadcast("mempool full".into()).is_retryable());
        assert!(!SnowballError::ChainIntegrity("txid mismatch".into()).is_retryable());
        assert!(!SnowballError::DustThresholdViolation {
            value: 100,
            threshold: 546,
            address_type: AddressType::Legacy,
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::DustThresholdViolation).unwrap();
        assert_eq!(json, "\"DUST_THRESHOLD_VIOLATION\"");
        assert_eq!(ErrorKind::ChainIntegrityError.to_string(), "CHAIN_INTEGRITY_ERROR");
    }
}
