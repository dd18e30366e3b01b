//! Core value types shared by every stage of the pipeline
//!
//! Nothing in here depends on another snowball module except the error type,
//! so the builder, broadcaster, verifier and order manager can all depend
//! downward on it.

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Network, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SnowballError};

/// Relay output index in every parent and child transaction
pub const RELAY_VOUT: u32 = 0;
/// Instruction (protostone) output index in single-relay transactions
pub const INSTRUCTION_VOUT: u32 = 1;
/// Change output index on the single-relay parent
pub const CHANGE_VOUT: u32 = 2;

/// Identifier of the alkanes contract being minted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractId {
    pub block: u64,
    pub tx: u64,
}

impl ContractId {
    pub fn new(block: u64, tx: u64) -> Self {
        Self { block, tx }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for ContractId {
    type Err = SnowballError;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| SnowballError::Validation(format!("contract id '{}' must be block:tx", s)))?;
        let block = block
            .trim()
            .parse::<u64>()
            .map_err(|_| SnowballError::Validation(format!("invalid contract block '{}'", block)))?;
        let tx = tx
            .trim()
            .parse::<u64>()
            .map_err(|_| SnowballError::Validation(format!("invalid contract tx '{}'", tx)))?;
        Ok(Self { block, tx })
    }
}

/// Address types a chain can pay to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Taproot P2TR address (bc1p...)
    Taproot,
    /// Native SegWit P2WPKH address (bc1q...)
    NativeSegwit,
    /// Nested SegWit P2SH-P2WPKH address (3...)
    NestedSegwit,
    /// Legacy P2PKH address (1...)
    Legacy,
}

impl AddressType {
    /// Minimum relayable output value for this address type
    pub fn dust_threshold(self) -> u64 {
        match self {
            AddressType::NativeSegwit => 294,
            AddressType::Taproot => 330,
            AddressType::NestedSegwit => 540,
            AddressType::Legacy => 546,
        }
    }

    /// Length of the scriptPubKey paid to by this address type
    pub fn script_pubkey_len(self) -> u64 {
        match self {
            AddressType::Taproot => 34,
            AddressType::NativeSegwit => 22,
            AddressType::NestedSegwit => 23,
            AddressType::Legacy => 25,
        }
    }

    /// Classify a parsed address
    pub fn of(address: &Address) -> Result<Self> {
        match address.address_type() {
            Some(bitcoin::AddressType::P2tr) => Ok(AddressType::Taproot),
            Some(bitcoin::AddressType::P2wpkh) => Ok(AddressType::NativeSegwit),
            Some(bitcoin::AddressType::P2sh) => Ok(AddressType::NestedSegwit),
            Some(bitcoin::AddressType::P2pkh) => Ok(AddressType::Legacy),
            other => Err(SnowballError::InvalidAddressType(format!(
                "{} has unsupported script type {:?}",
                address, other
            ))),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressType::Taproot => "taproot",
            AddressType::NativeSegwit => "native segwit",
            AddressType::NestedSegwit => "nested segwit",
            AddressType::Legacy => "legacy",
        };
        f.write_str(name)
    }
}

/// Fail with `DUST_THRESHOLD_VIOLATION` when `value` cannot be relayed
pub fn ensure_above_dust(value: u64, address_type: AddressType) -> Result<()> {
    let threshold = address_type.dust_threshold();
    if value < threshold {
        return Err(SnowballError::DustThresholdViolation {
            value,
            threshold,
            address_type,
        });
    }
    Ok(())
}

/// Parse an address string and check it belongs to `network`
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let unchecked = Address::from_str(address)?;
    unchecked.require_network(network).map_err(|e| {
        SnowballError::Validation(format!("address {} is not valid for {}: {}", address, network, e))
    })
}

/// Role of a transaction within a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Parent,
    CompositeParent,
    Child,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Parent => f.write_str("parent"),
            TxKind::CompositeParent => f.write_str("composite parent"),
            TxKind::Child => f.write_str("child"),
        }
    }
}

/// An unsigned transaction template and everything needed to sign and check it
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    /// Unsigned transaction (empty witnesses)
    pub tx: Transaction,
    /// Outputs being spent, in input order
    pub prevouts: Vec<TxOut>,
    /// Txid computed before signing; the broadcast txid must match it
    pub expected_txid: Txid,
    /// Value of vout 0 (the relay output)
    pub relay_output_value: u64,
    /// Fee paid by this transaction
    pub fee: u64,
    pub kind: TxKind,
    /// 0 for parents, 1-based hop number for children
    pub index: u32,
}

impl BuiltTransaction {
    pub fn unsigned_template_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    /// Sum of the values being spent
    pub fn input_value(&self) -> u64 {
        self.prevouts.iter().map(|p| p.value.to_sat()).sum()
    }

    /// Sum of all output values
    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }
}

/// Spendable output reported by a UTXO source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    pub script_pubkey: bitcoin::ScriptBuf,
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> bitcoin::OutPoint {
        bitcoin::OutPoint::new(self.txid, self.vout)
    }
}

/// Receiver balance read after every transaction of a chain confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalanceCheck {
    pub address: String,
    /// Balance held before the first transaction was sent
    #[serde(default)]
    pub baseline: u128,
    pub expected: u128,
    pub actual: u128,
    pub verified: bool,
}

impl AssetBalanceCheck {
    pub fn minted(&self) -> u128 {
        self.actual.saturating_sub(self.baseline)
    }
}
