//! Protostone encoding for the instruction output
//!
//! Every transaction in a chain carries one protostone in an OP_RETURN
//! runestone. The mint instruction is a cellpack `[block, tx, 77]` aimed at the
//! contract, with pointer and refund both on vout 0 so minted and forwarded
//! assets follow the relay output. Edicts are left empty so forwarding stays
//! implicit.

use alkanes_support::cellpack::Cellpack;
use alkanes_support::id::AlkaneId;
use bitcoin::ScriptBuf;
use log::{debug, warn};
use ordinals::Runestone;
use protorune_support::balance_sheet::ProtoruneRuneId;
use protorune_support::protostone::{Protostone, ProtostoneEdict, Protostones};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnowballError};
use crate::fee::INSTRUCTION_SCRIPT_BUDGET;
use crate::types::{ContractId, RELAY_VOUT};

/// Protocol tag for alkanes protostones
pub const ALKANES_PROTOCOL_TAG: u128 = 1;

/// Opcode of the contract mint entrypoint
pub const MINT_OPCODE: u128 = 77;

/// Largest OP_RETURN script relayed as standard
const MAX_STANDARD_OP_RETURN: usize = 83;

/// Explicit asset transfer inside a protostone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdictSpec {
    pub asset: ContractId,
    pub amount: u128,
    pub output: u32,
}

/// Everything needed to encode one protostone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtostoneSpec {
    pub protocol_tag: u128,
    pub edicts: Vec<EdictSpec>,
    pub pointer: Option<u32>,
    pub refund_pointer: Option<u32>,
    /// Cellpack words: target block, target tx, then inputs
    pub calldata: Vec<u128>,
}

impl ProtostoneSpec {
    /// Mint instruction for `contract_id`, pointing at the relay output
    pub fn mint(contract_id: ContractId) -> Self {
        Self {
            protocol_tag: ALKANES_PROTOCOL_TAG,
            edicts: Vec::new(),
            pointer: Some(RELAY_VOUT),
            refund_pointer: Some(RELAY_VOUT),
            calldata: vec![contract_id.block as u128, contract_id.tx as u128, MINT_OPCODE],
        }
    }

    fn cellpack(&self) -> Result<Cellpack> {
        match self.calldata.as_slice() {
            [block, tx, inputs @ ..] => Ok(Cellpack {
                target: AlkaneId { block: *block, tx: *tx },
                inputs: inputs.to_vec(),
            }),
            _ => Err(SnowballError::TransactionBuild(
                "protostone calldata needs at least a target block and tx".to_string(),
            )),
        }
    }
}

/// Encodes protostones into an OP_RETURN script
pub trait ProtostoneCodec: Send + Sync {
    fn encode(&self, spec: &ProtostoneSpec) -> Result<ScriptBuf>;
}

/// Codec backed by the alkanes `ordinals` runestone and `protorune-support` protostone encoders
#[derive(Debug, Clone, Copy, Default)]
pub struct RunestoneCodec;

impl ProtostoneCodec for RunestoneCodec {
    fn encode(&self, spec: &ProtostoneSpec) -> Result<ScriptBuf> {
        let cellpack = spec.cellpack()?;
        debug!(
            "Encoding protostone: target={}:{}, inputs={:?}, edicts={}",
            cellpack.target.block,
            cellpack.target.tx,
            cellpack.inputs,
            spec.edicts.len()
        );

        let edicts = spec
            .edicts
            .iter()
            .map(|edict| ProtostoneEdict {
                id: ProtoruneRuneId {
                    block: edict.asset.block as u128,
                    tx: edict.asset.tx as u128,
                },
                amount: edict.amount,
                output: edict.output as u128,
            })
            .collect();

        let protostone = Protostone {
            burn: None,
            message: cellpack.encipher(),
            edicts,
            refund: spec.refund_pointer,
            pointer: spec.pointer,
            from: None,
            protocol_tag: spec.protocol_tag,
        };

        let protocol = vec![protostone]
            .encipher()
            .map_err(|e| SnowballError::TransactionBuild(format!("failed to encipher protostone: {}", e)))?;

        let script = Runestone {
            etching: None,
            pointer: None,
            edicts: vec![],
            mint: None,
            protocol: Some(protocol),
        }
        .encipher();
        let script = ScriptBuf::from_bytes(script.as_bytes().to_vec());

        if script.len() > MAX_STANDARD_OP_RETURN {
            return Err(SnowballError::TransactionBuild(format!(
                "protostone script is {} bytes, above the {} byte relay limit",
                script.len(),
                MAX_STANDARD_OP_RETURN
            )));
        }
        if script.len() as u64 > INSTRUCTION_SCRIPT_BUDGET {
            warn!(
                "Protostone script is {} bytes; fee estimates assume {}",
                script.len(),
                INSTRUCTION_SCRIPT_BUDGET
            );
        }
        Ok(script)
    }
}

/// Encoded mint instruction for `contract_id`
pub fn mint_protostone(codec: &dyn ProtostoneCodec, contract_id: ContractId) -> Result<ScriptBuf> {
    codec.encode(&ProtostoneSpec::mint(contract_id))
}
