//! In-memory chain backend for scenario tests
//!
//! Simulates a node closely enough to exercise chains end to end:
//! - Mempool and blocks, with optional mining on every acceptance
//! - UTXO tracking with missing/spent input and value checks
//! - Optional refusal of children of unconfirmed parents
//! - Implicit asset forwarding: inputs' tokens move to vout 0 and every
//!   transaction carrying an OP_RETURN mints one more token there
//! - Fault injection (outages, lost responses, rejected scripts)
//!
//! Witnesses must be present but signatures are not checked.

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SnowballError};
use crate::rpc::{AssetQuery, BroadcastBackend, ConfirmationStatus, UtxoSource};
use crate::signer::SignedTransaction;
use crate::types::{ContractId, Utxo};

#[derive(Debug, Default)]
struct ChainState {
    /// Known transactions and the height they confirmed at
    txs: HashMap<Txid, Option<u64>>,
    unspent: HashMap<OutPoint, TxOut>,
    tokens: HashMap<OutPoint, u128>,
    height: u64,
    nonce: u64,
    accepted: Vec<Txid>,
    chaining_disabled: bool,
    auto_mine: bool,
    fail_next_submits: u32,
    fail_after_accepted: Option<usize>,
    drop_next_responses: u32,
    rejected_scripts: HashSet<ScriptBuf>,
}

impl ChainState {
    fn mine(&mut self) -> u64 {
        self.height += 1;
        let height = self.height;
        for confirmed in self.txs.values_mut().filter(|h| h.is_none()) {
            *confirmed = Some(height);
        }
        height
    }

    /// Confirmed output that did not come from a submitted transaction
    fn mint_coins(&mut self, script_pubkey: ScriptBuf, value: u64) -> OutPoint {
        self.nonce += 1;
        let coinbase = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(self.nonce.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            }],
        };
        let txid = coinbase.compute_txid();
        let outpoint = OutPoint::new(txid, 0);
        self.txs.insert(txid, Some(self.height));
        self.unspent.insert(outpoint, coinbase.output[0].clone());
        outpoint
    }
}

#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Give `address` a confirmed output of `value` sats
    pub fn fund(&self, address: &Address, value: u64) -> Utxo {
        let mut state = self.lock();
        let outpoint = state.mint_coins(address.script_pubkey(), value);
        Utxo {
            txid: outpoint.txid,
            vout: outpoint.vout,
            value,
            script_pubkey: address.script_pubkey(),
            confirmations: 1,
        }
    }

    /// Give `address` a dust output already carrying `amount` tokens
    pub fn grant_tokens(&self, address: &Address, amount: u128) {
        let mut state = self.lock();
        let outpoint = state.mint_coins(address.script_pubkey(), 330);
        state.tokens.insert(outpoint, amount);
    }

    /// A valid, not yet submitted spend of a fresh funded output
    pub fn fund_dummy_tx(&self, value: u64) -> SignedTransaction {
        let anyone = ScriptBuf::from_bytes(vec![0x51]);
        let outpoint = self.lock().mint_coins(anyone.clone(), value);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::from_slice(&[[1u8]]),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value - 200),
                script_pubkey: anyone,
            }],
        };
        SignedTransaction {
            txid: tx.compute_txid(),
            hex: serialize_hex(&tx),
            tx,
        }
    }

    /// Validate and admit a transaction to the mempool
    pub fn accept(&self, signed_hex: &str) -> Result<Txid> {
        let bytes = hex::decode(signed_hex).map_err(|e| SnowballError::Broadcast(format!("TX decode failed: {}", e)))?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|e| SnowballError::Broadcast(format!("TX decode failed: {}", e)))?;
        let txid = tx.compute_txid();

        let mut state = self.lock();
        if state.txs.contains_key(&txid) {
            return Err(SnowballError::Broadcast("txn-already-known".to_string()));
        }

        let mut in_value = 0u64;
        let mut tokens = 0u128;
        for input in &tx.input {
            if input.witness.is_empty() {
                return Err(SnowballError::Broadcast(
                    "mandatory-script-verify-flag-failed (Witness program was passed an empty witness)".to_string(),
                ));
            }
            let prev = state
                .unspent
                .get(&input.previous_output)
                .ok_or_else(|| SnowballError::Broadcast("bad-txns-inputs-missingorspent".to_string()))?;
            if state.rejected_scripts.contains(&prev.script_pubkey) {
                return Err(SnowballError::Broadcast("non-mandatory-script-verify-flag (policy)".to_string()));
            }
            if state.chaining_disabled && state.txs.get(&input.previous_output.txid) == Some(&None) {
                return Err(SnowballError::Broadcast("bad-txns-spends-unconfirmed".to_string()));
            }
            in_value += prev.value.to_sat();
            tokens += state.tokens.get(&input.previous_output).copied().unwrap_or(0);
        }
        let out_value: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        if out_value > in_value {
            return Err(SnowballError::Broadcast("bad-txns-in-belowout".to_string()));
        }

        for input in &tx.input {
            state.unspent.remove(&input.previous_output);
            state.tokens.remove(&input.previous_output);
        }
        if tx.output.iter().any(|o| o.script_pubkey.is_op_return()) {
            tokens += 1;
        }
        for (vout, output) in tx.output.iter().enumerate() {
            if !output.script_pubkey.is_op_return() {
                state.unspent.insert(OutPoint::new(txid, vout as u32), output.clone());
            }
        }
        if tokens > 0 {
            state.tokens.insert(OutPoint::new(txid, 0), tokens);
        }
        state.txs.insert(txid, None);
        state.accepted.push(txid);
        if state.auto_mine {
            state.mine();
        }
        Ok(txid)
    }

    /// Confirm everything in the mempool, returning the new height
    pub fn mine_block(&self) -> u64 {
        self.lock().mine()
    }

    pub fn fail_next_submits(&self, count: u32) {
        self.lock().fail_next_submits = count;
    }

    /// Refuse every submission once `count` transactions have been accepted
    pub fn fail_after_accepted(&self, count: usize) {
        self.lock().fail_after_accepted = Some(count);
    }

    /// Accept the next submissions but report a lost connection
    pub fn drop_next_responses(&self, count: u32) {
        self.lock().drop_next_responses = count;
    }

    pub fn reject_spends_from(&self, script_pubkey: ScriptBuf) {
        self.lock().rejected_scripts.insert(script_pubkey);
    }

    /// Remove every injected fault
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_next_submits = 0;
        state.fail_after_accepted = None;
        state.drop_next_responses = 0;
        state.rejected_scripts.clear();
    }

    pub fn set_unconfirmed_chaining(&self, enabled: bool) {
        self.lock().chaining_disabled = !enabled;
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        self.lock().auto_mine = enabled;
    }

    pub fn is_known(&self, txid: &Txid) -> bool {
        self.lock().txs.contains_key(txid)
    }

    /// Submitted transactions in acceptance order
    pub fn accepted(&self) -> Vec<Txid> {
        self.lock().accepted.clone()
    }

    /// Tokens held by outputs paying `address`
    pub fn token_balance(&self, address: &Address) -> u128 {
        let state = self.lock();
        let script = address.script_pubkey();
        state
            .tokens
            .iter()
            .filter(|(outpoint, _)| state.unspent.get(outpoint).map(|o| &o.script_pubkey) == Some(&script))
            .map(|(_, amount)| *amount)
            .sum()
    }

    /// Fixed taproot address outside any test wallet
    pub fn receiver_address(&self) -> Address {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        Address::p2tr(&secp, keypair.x_only_public_key().0, None, Network::Regtest)
    }
}

#[async_trait]
impl BroadcastBackend for MockChain {
    async fn submit(&self, signed_hex: &str) -> Result<Txid> {
        {
            let mut state = self.lock();
            if state.fail_next_submits > 0 {
                state.fail_next_submits -= 1;
                return Err(SnowballError::Network("injected outage".to_string()));
            }
            if state.fail_after_accepted.is_some_and(|limit| state.accepted.len() >= limit) {
                return Err(SnowballError::Network("node unreachable".to_string()));
            }
        }
        let txid = self.accept(signed_hex)?;
        let mut state = self.lock();
        if state.drop_next_responses > 0 {
            state.drop_next_responses -= 1;
            return Err(SnowballError::Network("connection reset by peer".to_string()));
        }
        Ok(txid)
    }

    async fn query_mempool(&self, txid: &Txid) -> Result<bool> {
        Ok(self.lock().txs.get(txid) == Some(&None))
    }

    async fn query_confirmation(&self, txid: &Txid) -> Result<ConfirmationStatus> {
        Ok(match self.lock().txs.get(txid) {
            None => ConfirmationStatus::Unknown,
            Some(None) => ConfirmationStatus::InMempool,
            Some(Some(height)) => ConfirmationStatus::Confirmed { block_height: *height },
        })
    }

    fn supports_unconfirmed_chaining(&self) -> bool {
        !self.lock().chaining_disabled
    }
}

#[async_trait]
impl UtxoSource for MockChain {
    async fn list_spendable(&self, address: &Address) -> Result<Vec<Utxo>> {
        let state = self.lock();
        let script = address.script_pubkey();
        let mut utxos: Vec<Utxo> = state
            .unspent
            .iter()
            .filter(|(_, output)| output.script_pubkey == script)
            .map(|(outpoint, output)| Utxo {
                txid: outpoint.txid,
                vout: outpoint.vout,
                value: output.value.to_sat(),
                script_pubkey: output.script_pubkey.clone(),
                confirmations: match state.txs.get(&outpoint.txid) {
                    Some(Some(height)) => (state.height - height + 1) as u32,
                    _ => 0,
                },
            })
            .collect();
        utxos.sort_by_key(|u| (u.txid, u.vout));
        Ok(utxos)
    }
}

#[async_trait]
impl AssetQuery for MockChain {
    async fn balance_of(&self, address: &Address, _contract_id: ContractId) -> Result<u128> {
        Ok(self.token_balance(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokens_follow_vout_zero() -> anyhow::Result<()> {
        let chain = MockChain::new();
        let tx = chain.fund_dummy_tx(10_000);
        chain.accept(&tx.hex)?;
        assert!(chain.query_mempool(&tx.txid).await?);
        assert!(chain.accept(&tx.hex).is_err());

        chain.mine_block();
        assert_eq!(
            chain.query_confirmation(&tx.txid).await?,
            ConfirmationStatus::Confirmed { block_height: 1 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_spent_inputs_rejected() {
        let chain = MockChain::new();
        let tx = chain.fund_dummy_tx(10_000);
        let mut double = tx.tx.clone();
        double.output[0].value = Amount::from_sat(1_000);
        chain.accept(&tx.hex).unwrap();
        let err = chain.accept(&serialize_hex(&double)).unwrap_err();
        assert!(err.to_string().contains("missingorspent"));
    }
}
