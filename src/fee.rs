//! Fee and size calculation for chain transactions
//!
//! Planning hundreds of hops by building a real transaction per estimate is
//! wasteful, so every transaction shape gets a fixed virtual size derived from
//! the weights of its parts. A built and signed transaction can be measured with
//! [`calculate_actual_transaction_fees`] and checked against the estimate with
//! [`validate_fee_estimate`].

use bitcoin::Transaction;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnowballError};
use crate::types::AddressType;

/// Lowest accepted fee rate in sat/vB
pub const MIN_FEE_RATE: u64 = 1;
/// Highest accepted fee rate in sat/vB
pub const MAX_FEE_RATE: u64 = 1_000;

/// Extra funding kept on top of the planned spend
pub const SAFETY_BUFFER_SATS: u64 = 1_000;

/// Weight units for version, locktime, in/out counts and the segwit marker+flag
const TX_OVERHEAD_WU: u64 = 4 * (4 + 4 + 1 + 1) + 2;
/// Outpoint, empty scriptSig and sequence
const INPUT_BASE_WU: u64 = 4 * (32 + 4 + 1 + 4);
/// Witness stack count + one 64 byte schnorr signature
const TAPROOT_WITNESS_WU: u64 = 1 + 1 + 64;
/// Witness stack count + DER signature with sighash byte + compressed key
const P2WPKH_WITNESS_WU: u64 = 1 + 1 + 72 + 1 + 33;

/// Script length budget for the protostone OP_RETURN
pub const INSTRUCTION_SCRIPT_BUDGET: u64 = 48;

pub const TAPROOT_INPUT_WU: u64 = INPUT_BASE_WU + TAPROOT_WITNESS_WU;
pub const P2WPKH_INPUT_WU: u64 = INPUT_BASE_WU + P2WPKH_WITNESS_WU;

const fn output_wu(script_len: u64) -> u64 {
    4 * (8 + 1 + script_len)
}

const fn vsize_of(weight: u64) -> u64 {
    (weight + 3) / 4
}

const P2WPKH_OUTPUT_WU: u64 = output_wu(22);
const P2TR_OUTPUT_WU: u64 = output_wu(34);
const INSTRUCTION_OUTPUT_WU: u64 = output_wu(INSTRUCTION_SCRIPT_BUDGET);

/// Parent: one taproot input, P2WPKH relay output, OP_RETURN, taproot change
pub const PARENT_TX_VSIZE: u64 =
    vsize_of(TX_OVERHEAD_WU + TAPROOT_INPUT_WU + P2WPKH_OUTPUT_WU + INSTRUCTION_OUTPUT_WU + P2TR_OUTPUT_WU);
/// Ordinary child: one P2WPKH input, P2WPKH relay output, OP_RETURN
pub const CHILD_TX_VSIZE: u64 = vsize_of(TX_OVERHEAD_WU + P2WPKH_INPUT_WU + P2WPKH_OUTPUT_WU + INSTRUCTION_OUTPUT_WU);
/// Final child: one P2WPKH input, P2TR receiver output, OP_RETURN
pub const FINAL_CHILD_TX_VSIZE: u64 =
    vsize_of(TX_OVERHEAD_WU + P2WPKH_INPUT_WU + P2TR_OUTPUT_WU + INSTRUCTION_OUTPUT_WU);

/// Transaction shapes the planner knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxShape {
    Parent,
    Child,
    FinalChild,
}

impl TxShape {
    pub fn virtual_size(self) -> u64 {
        match self {
            TxShape::Parent => PARENT_TX_VSIZE,
            TxShape::Child => CHILD_TX_VSIZE,
            TxShape::FinalChild => FINAL_CHILD_TX_VSIZE,
        }
    }
}

/// Fee for one transaction shape at a given rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFee {
    pub virtual_size: u64,
    pub base_fee: u64,
    pub total_fee: u64,
    pub fee_rate: u64,
}

impl TxFee {
    fn at_rate(virtual_size: u64, fee_rate: u64) -> Self {
        let base_fee = virtual_size * fee_rate;
        Self {
            virtual_size,
            base_fee,
            total_fee: base_fee,
            fee_rate,
        }
    }
}

/// Fees and funding requirements for one serial chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeCalculation {
    pub parent_tx: TxFee,
    pub child_tx: TxFee,
    pub child_count: u32,
    pub total_child_fees: u64,
    /// Value of the parent's relay output: every downstream fee plus the final dust
    pub relay_fuel_amount: u64,
    pub total_required_funding: u64,
    pub safety_buffer: u64,
    /// Dust floor the last output must respect
    pub final_dust: u64,
}

/// Fee measured on an actually built transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualFee {
    pub virtual_size: u64,
    pub weight: u64,
    pub fee: u64,
    pub fee_rate: u64,
}

/// Outcome of comparing an estimate with a measured transaction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeAccuracy {
    pub estimated_vsize: u64,
    pub actual_vsize: u64,
    pub deviation_pct: f64,
    pub within_tolerance: bool,
}

/// Reject fee rates outside `[MIN_FEE_RATE, MAX_FEE_RATE]`
pub fn validate_fee_rate(fee_rate: u64) -> Result<()> {
    if !(MIN_FEE_RATE..=MAX_FEE_RATE).contains(&fee_rate) {
        return Err(SnowballError::FeeCalculation(format!(
            "fee rate {} sat/vB is outside [{}, {}]",
            fee_rate, MIN_FEE_RATE, MAX_FEE_RATE
        )));
    }
    Ok(())
}

/// `virtual_size(shape) × fee_rate`
pub fn fee(shape: TxShape, fee_rate: u64) -> Result<u64> {
    validate_fee_rate(fee_rate)?;
    Ok(shape.virtual_size() * fee_rate)
}

/// Virtual size of a child paying its relay output to `output_type`
pub fn child_vsize_for(output_type: AddressType) -> u64 {
    vsize_of(TX_OVERHEAD_WU + P2WPKH_INPUT_WU + output_wu(output_type.script_pubkey_len()) + INSTRUCTION_OUTPUT_WU)
}

/// Uniform per-hop child fee for a chain ending at `final_receiver_type`.
///
/// Every hop pays the larger of the ordinary and final shapes so that
/// `value(i) - value(i + 1)` is the same for all hops.
pub fn child_fee(fee_rate: u64, final_receiver_type: AddressType) -> Result<TxFee> {
    validate_fee_rate(fee_rate)?;
    let vsize = CHILD_TX_VSIZE.max(child_vsize_for(final_receiver_type));
    Ok(TxFee::at_rate(vsize, fee_rate))
}

fn input_wu(address_type: AddressType) -> Result<u64> {
    match address_type {
        AddressType::Taproot => Ok(TAPROOT_INPUT_WU),
        AddressType::NativeSegwit => Ok(P2WPKH_INPUT_WU),
        other => Err(SnowballError::InvalidAddressType(format!(
            "{} inputs cannot fund a chain",
            other
        ))),
    }
}

/// Virtual size of a parent with `input_count` funding inputs and `relay_outputs` relay outputs
pub fn parent_vsize(
    funding_type: AddressType,
    input_count: usize,
    relay_outputs: usize,
    change: Option<AddressType>,
) -> Result<u64> {
    let mut weight = TX_OVERHEAD_WU + INSTRUCTION_OUTPUT_WU;
    weight += input_wu(funding_type)? * input_count as u64;
    weight += P2WPKH_OUTPUT_WU * relay_outputs as u64;
    if let Some(change_type) = change {
        weight += output_wu(change_type.script_pubkey_len());
    }
    // Counts above 252 need a three byte compact size.
    if input_count > 252 {
        weight += 4 * 2;
    }
    if relay_outputs + 2 > 252 {
        weight += 4 * 2;
    }
    Ok(vsize_of(weight))
}

/// Composite parent size: one relay output per slice plus instruction and change
pub fn composite_parent_vsize(
    funding_type: AddressType,
    input_count: usize,
    slice_count: usize,
    change: Option<AddressType>,
) -> Result<u64> {
    parent_vsize(funding_type, input_count, slice_count, change)
}

/// Planned fees for a serial chain of `child_count` hops
pub fn calculate_fees(fee_rate: u64, child_count: u32, final_receiver_type: AddressType) -> Result<FeeCalculation> {
    validate_fee_rate(fee_rate)?;
    if child_count == 0 {
        return Err(SnowballError::FeeCalculation("child count must be at least 1".to_string()));
    }

    let parent_tx = TxFee::at_rate(PARENT_TX_VSIZE, fee_rate);
    let child_tx = child_fee(fee_rate, final_receiver_type)?;
    let total_child_fees = child_tx.total_fee * child_count as u64;
    let final_dust = final_receiver_type.dust_threshold();
    let relay_fuel_amount = total_child_fees + final_dust;
    let safety_buffer = SAFETY_BUFFER_SATS;
    let total_required_funding = relay_fuel_amount + parent_tx.total_fee + safety_buffer;

    debug!(
        "Planned chain: {} children at {} sat/vB, child fee {} sats, relay fuel {} sats, funding {} sats",
        child_count, fee_rate, child_tx.total_fee, relay_fuel_amount, total_required_funding
    );

    Ok(FeeCalculation {
        parent_tx,
        child_tx,
        child_count,
        total_child_fees,
        relay_fuel_amount,
        total_required_funding,
        safety_buffer,
        final_dust,
    })
}

/// Fee for a child that accelerates its unconfirmed parent.
///
/// The package (parent + child) should pay `package_fee_rate`; the parent has
/// already paid `parent_fee`, so the child covers the remainder. The child never
/// pays less than its own size at the package rate.
pub fn cpfp_child_fee(package_fee_rate: u64, parent_vsize: u64, parent_fee: u64, child_vsize: u64) -> Result<u64> {
    validate_fee_rate(package_fee_rate)?;
    let package_fee = package_fee_rate * (parent_vsize + child_vsize);
    let own_fee = package_fee_rate * child_vsize;
    Ok(package_fee.saturating_sub(parent_fee).max(own_fee))
}

/// Measure a signed transaction at `fee_rate`
pub fn calculate_actual_transaction_fees(tx: &Transaction, fee_rate: u64) -> Result<ActualFee> {
    validate_fee_rate(fee_rate)?;
    let virtual_size = tx.vsize() as u64;
    Ok(ActualFee {
        virtual_size,
        weight: tx.weight().to_wu(),
        fee: virtual_size * fee_rate,
        fee_rate,
    })
}

/// Compare an estimated size with a measured one
pub fn validate_fee_estimate(estimated_vsize: u64, actual: &ActualFee, tolerance_pct: f64) -> FeeAccuracy {
    let diff = estimated_vsize.abs_diff(actual.virtual_size) as f64;
    let deviation_pct = if actual.virtual_size == 0 {
        100.0
    } else {
        diff * 100.0 / actual.virtual_size as f64
    };
    // Overestimating is harmless; underestimating means the chain pays below rate.
    let within_tolerance = estimated_vsize >= actual.virtual_size || deviation_pct <= tolerance_pct;
    if !within_tolerance {
        warn!(
            "Fee estimate off by {:.2}%: estimated {} vB, actual {} vB",
            deviation_pct, estimated_vsize, actual.virtual_size
        );
    }
    FeeAccuracy {
        estimated_vsize,
        actual_vsize: actual.virtual_size,
        deviation_pct,
        within_tolerance,
    }
}
