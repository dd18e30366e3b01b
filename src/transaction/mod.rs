//! Transaction construction for mint chains
//!
//! This module handles:
//! - Parent construction with greedy UTXO selection
//! - Child construction spending the previous relay output
//! - Composite parents funding several slices at once
//! - Chain integrity validation over built (unsigned) transactions
//!
//! Every transaction is assembled unsigned; since all inputs are segwit the
//! txid is fixed at this point and recorded as `expected_txid`.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, SnowballError};
use crate::fee::{self, FeeCalculation};
use crate::protostone::{mint_protostone, ProtostoneCodec};
use crate::types::{ensure_above_dust, AddressType, BuiltTransaction, ContractId, TxKind, Utxo, RELAY_VOUT};
use crate::wallet::{ChainWallets, Wallet};

/// The output a child spends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
}

impl ChainAnchor {
    pub fn relay_of(built: &BuiltTransaction) -> Self {
        Self {
            txid: built.expected_txid,
            vout: RELAY_VOUT,
            value: built.relay_output_value,
        }
    }
}

/// Result of `validate_chain_integrity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIntegrityReport {
    pub is_valid: bool,
    pub broken_at_index: Option<usize>,
    pub reason: Option<String>,
}

impl ChainIntegrityReport {
    fn valid() -> Self {
        Self {
            is_valid: true,
            broken_at_index: None,
            reason: None,
        }
    }

    fn broken(index: usize, reason: String) -> Self {
        Self {
            is_valid: false,
            broken_at_index: Some(index),
            reason: Some(reason),
        }
    }

    /// Turn a broken report into a `CHAIN_INTEGRITY_ERROR`
    pub fn into_result(self) -> Result<()> {
        match (self.is_valid, self.broken_at_index, self.reason) {
            (true, _, _) => Ok(()),
            (false, index, reason) => Err(SnowballError::ChainIntegrity(format!(
                "chain broken at index {}: {}",
                index.unwrap_or_default(),
                reason.unwrap_or_default()
            ))),
        }
    }
}

/// One relay output of a composite parent
#[derive(Debug, Clone)]
pub struct SliceFunding {
    pub relay_address: Address,
    pub value: u64,
}

fn unsigned_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    }
}

fn assemble(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}

/// Inputs picked for a parent and the fee they imply
struct Selection {
    utxos: Vec<Utxo>,
    total: u64,
    fee_without_change: u64,
    fee_with_change: u64,
}

/// Builds unsigned chain transactions
pub struct TransactionBuilder {
    codec: Arc<dyn ProtostoneCodec>,
}

impl TransactionBuilder {
    pub fn new(codec: Arc<dyn ProtostoneCodec>) -> Self {
        Self { codec }
    }

    fn instruction_output(&self, contract_id: ContractId) -> Result<TxOut> {
        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: mint_protostone(self.codec.as_ref(), contract_id)?,
        })
    }

    /// Largest-first selection until `outputs_value + fee(n_inputs)` is covered
    fn select_utxos(
        &self,
        funding: &Wallet,
        utxos: &[Utxo],
        outputs_value: u64,
        relay_outputs: usize,
        fee_rate: u64,
    ) -> Result<Selection> {
        let funding_type = funding.address_type;
        let mut candidates: Vec<&Utxo> = utxos.iter().collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in candidates {
            selected.push(utxo.clone());
            total += utxo.value;
            let fee_without_change =
                fee::parent_vsize(funding_type, selected.len(), relay_outputs, None)? * fee_rate;
            if total >= outputs_value + fee_without_change {
                let fee_with_change =
                    fee::parent_vsize(funding_type, selected.len(), relay_outputs, Some(funding_type))? * fee_rate;
                return Ok(Selection {
                    utxos: selected,
                    total,
                    fee_without_change,
                    fee_with_change,
                });
            }
        }

        let needed = outputs_value + fee::parent_vsize(funding_type, selected.len().max(1), relay_outputs, None)? * fee_rate;
        Err(SnowballError::InsufficientFunds(format!(
            "{} holds {} sats in {} UTXOs, {} sats needed",
            funding.address,
            total,
            selected.len(),
            needed
        )))
    }

    /// Assemble a parent from `relay` outputs plus the instruction output and optional change
    fn build_funding_tx(
        &self,
        funding: &Wallet,
        relay: Vec<TxOut>,
        contract_id: ContractId,
        fee_rate: u64,
        utxos: &[Utxo],
        kind: TxKind,
    ) -> Result<BuiltTransaction> {
        let relay_total: u64 = relay.iter().map(|o| o.value.to_sat()).sum();
        let relay_count = relay.len();
        let selection = self.select_utxos(funding, utxos, relay_total, relay_count, fee_rate)?;

        let mut output = relay;
        output.push(self.instruction_output(contract_id)?);

        let change_floor = funding.address_type.dust_threshold();
        let change = selection
            .total
            .checked_sub(relay_total + selection.fee_with_change)
            .filter(|change| *change >= change_floor);
        let fee = match change {
            Some(change) => {
                output.push(TxOut {
                    value: Amount::from_sat(change),
                    script_pubkey: funding.address.script_pubkey(),
                });
                selection.fee_with_change
            }
            // Sub-dust change is left to the miner.
            None => selection.total - relay_total,
        };
        debug_assert!(fee >= selection.fee_without_change);

        let input = selection.utxos.iter().map(|u| unsigned_input(u.outpoint())).collect();
        let prevouts = selection
            .utxos
            .iter()
            .map(|u| TxOut {
                value: Amount::from_sat(u.value),
                script_pubkey: u.script_pubkey.clone(),
            })
            .collect();
        let tx = assemble(input, output);
        let relay_output_value = tx.output[RELAY_VOUT as usize].value.to_sat();

        let built = BuiltTransaction {
            expected_txid: tx.compute_txid(),
            tx,
            prevouts,
            relay_output_value,
            fee,
            kind,
            index: 0,
        };
        info!(
            "Built {} {} with {} inputs, {} relay outputs, fee {} sats",
            kind,
            built.expected_txid,
            built.tx.input.len(),
            relay_count,
            fee
        );
        Ok(built)
    }

    /// Parent transaction: relay fuel on vout 0, mint instruction on vout 1, change on vout 2
    pub fn build_parent(
        &self,
        wallets: &ChainWallets,
        contract_id: ContractId,
        fees: &FeeCalculation,
        utxos: &[Utxo],
    ) -> Result<BuiltTransaction> {
        ensure_above_dust(fees.relay_fuel_amount, wallets.relay.address_type)?;
        let relay = vec![TxOut {
            value: Amount::from_sat(fees.relay_fuel_amount),
            script_pubkey: wallets.relay.address.script_pubkey(),
        }];
        self.build_funding_tx(
            &wallets.funding,
            relay,
            contract_id,
            fees.parent_tx.fee_rate,
            utxos,
            TxKind::Parent,
        )
    }

    /// Composite parent: one relay output per slice, then instruction and change
    pub fn build_composite_parent(
        &self,
        funding: &Wallet,
        slices: &[SliceFunding],
        contract_id: ContractId,
        fee_rate: u64,
        utxos: &[Utxo],
    ) -> Result<BuiltTransaction> {
        fee::validate_fee_rate(fee_rate)?;
        if slices.is_empty() {
            return Err(SnowballError::TransactionBuild(
                "composite parent needs at least one slice".to_string(),
            ));
        }
        let mut relay = Vec::with_capacity(slices.len());
        for slice in slices {
            ensure_above_dust(slice.value, AddressType::of(&slice.relay_address)?)?;
            relay.push(TxOut {
                value: Amount::from_sat(slice.value),
                script_pubkey: slice.relay_address.script_pubkey(),
            });
        }
        self.build_funding_tx(funding, relay, contract_id, fee_rate, utxos, TxKind::CompositeParent)
    }

    /// Child spending `parent_txid:0`
    #[allow(clippy::too_many_arguments)]
    pub fn build_child(
        &self,
        parent_txid: Txid,
        parent_output_value: u64,
        index: u32,
        is_last: bool,
        wallets: &ChainWallets,
        contract_id: ContractId,
        child_fee: u64,
    ) -> Result<BuiltTransaction> {
        let anchor = ChainAnchor {
            txid: parent_txid,
            vout: RELAY_VOUT,
            value: parent_output_value,
        };
        self.build_child_at(anchor, index, is_last, wallets, contract_id, child_fee)
    }

    /// Child spending an arbitrary relay output (slice children spend composite parent vouts)
    pub fn build_child_at(
        &self,
        anchor: ChainAnchor,
        index: u32,
        is_last: bool,
        wallets: &ChainWallets,
        contract_id: ContractId,
        child_fee: u64,
    ) -> Result<BuiltTransaction> {
        let (destination, destination_type) = if is_last {
            (&wallets.final_receiver, wallets.final_receiver_type()?)
        } else {
            (&wallets.relay.address, wallets.relay.address_type)
        };

        let value = anchor.value.checked_sub(child_fee).ok_or_else(|| {
            SnowballError::TransactionBuild(format!(
                "child {} fee of {} sats exceeds its {} sat input",
                index, child_fee, anchor.value
            ))
        })?;
        // A hop that cannot stay above dust means the chain ran out of fuel.
        ensure_above_dust(value, destination_type)
            .map_err(|e| SnowballError::TransactionBuild(format!("child {}: {}", index, e)))?;

        let prevout = TxOut {
            value: Amount::from_sat(anchor.value),
            script_pubkey: wallets.relay.address.script_pubkey(),
        };
        let output = vec![
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: destination.script_pubkey(),
            },
            self.instruction_output(contract_id)?,
        ];
        let tx = assemble(vec![unsigned_input(OutPoint::new(anchor.txid, anchor.vout))], output);

        Ok(BuiltTransaction {
            expected_txid: tx.compute_txid(),
            tx,
            prevouts: vec![prevout],
            relay_output_value: value,
            fee: child_fee,
            kind: TxKind::Child,
            index,
        })
    }

    /// Children `from_index..=child_count`, each spending its predecessor's vout 0.
    ///
    /// `first_fee` overrides the fee of the child at `from_index` (used for CPFP).
    #[allow(clippy::too_many_arguments)]
    pub fn build_child_chain(
        &self,
        anchor: ChainAnchor,
        from_index: u32,
        child_count: u32,
        wallets: &ChainWallets,
        contract_id: ContractId,
        child_fee: u64,
        first_fee: Option<u64>,
    ) -> Result<Vec<BuiltTransaction>> {
        if from_index == 0 || from_index > child_count {
            return Err(SnowballError::TransactionBuild(format!(
                "child index {} outside 1..={}",
                from_index, child_count
            )));
        }

        let mut chain = Vec::with_capacity((child_count - from_index + 1) as usize);
        let mut anchor = anchor;
        for index in from_index..=child_count {
            let fee = match first_fee {
                Some(fee) if index == from_index => fee,
                _ => child_fee,
            };
            let child = self.build_child_at(anchor, index, index == child_count, wallets, contract_id, fee)?;
            anchor = ChainAnchor::relay_of(&child);
            chain.push(child);
        }
        debug!(
            "Built children {}..={} ending at {}",
            from_index,
            child_count,
            chain.last().map(|c| c.expected_txid.to_string()).unwrap_or_default()
        );
        Ok(chain)
    }
}

/// Check that every element spends its predecessor and pays exactly its recorded fee
pub fn validate_chain_integrity(transactions: &[BuiltTransaction]) -> ChainIntegrityReport {
    for (i, built) in transactions.iter().enumerate() {
        if built.tx.compute_txid() != built.expected_txid {
            return ChainIntegrityReport::broken(i, "expected txid does not match the template".to_string());
        }
        if built.prevouts.len() != built.tx.input.len() {
            return ChainIntegrityReport::broken(i, "prevout count differs from input count".to_string());
        }
        let paid = built.input_value().checked_sub(built.output_value());
        if paid != Some(built.fee) {
            return ChainIntegrityReport::broken(
                i,
                format!("recorded fee {} differs from inputs minus outputs {:?}", built.fee, paid),
            );
        }

        let Some(pred) = i.checked_sub(1).map(|p| &transactions[p]) else {
            continue;
        };
        if built.tx.input.len() != 1 {
            return ChainIntegrityReport::broken(i, format!("{} inputs, chain links have one", built.tx.input.len()));
        }
        let spent = built.tx.input[0].previous_output;
        if spent.txid != pred.expected_txid {
            return ChainIntegrityReport::broken(
                i,
                format!("spends {} instead of predecessor {}", spent.txid, pred.expected_txid),
            );
        }
        if pred.kind != TxKind::CompositeParent && spent.vout != RELAY_VOUT {
            return ChainIntegrityReport::broken(i, format!("spends vout {} instead of the relay output", spent.vout));
        }
        let Some(spent_output) = pred.tx.output.get(spent.vout as usize) else {
            return ChainIntegrityReport::broken(i, format!("predecessor has no vout {}", spent.vout));
        };
        let spent_value = spent_output.value.to_sat();
        if built.prevouts[0].value.to_sat() != spent_value {
            return ChainIntegrityReport::broken(
                i,
                format!(
                    "prevout value {} differs from predecessor output {}",
                    built.prevouts[0].value.to_sat(),
                    spent_value
                ),
            );
        }
        if spent_value.checked_sub(built.relay_output_value) != Some(built.fee) {
            return ChainIntegrityReport::broken(
                i,
                format!(
                    "value step {} -> {} does not equal fee {}",
                    spent_value, built.relay_output_value, built.fee
                ),
            );
        }
    }
    ChainIntegrityReport::valid()
}
