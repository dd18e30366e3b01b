//! Transaction signing for chain transactions
//!
//! This module provides:
//! - The `TransactionSigner` seam the executor signs through
//! - `LocalSigner`, which signs taproot key-path (BIP341) and P2WPKH (BIP143)
//!   inputs with keys held in memory
//!
//! Signing only ever fills witnesses, so the txid of a signed transaction must
//! equal the `expected_txid` computed from the unsigned template.

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ecdsa;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot;
use bitcoin::{Transaction, Txid, Witness};
use log::debug;

use crate::error::{Result, SnowballError};
use crate::types::BuiltTransaction;
use crate::wallet::{Wallet, WalletKey};

/// A fully signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub txid: Txid,
    pub hex: String,
    pub tx: Transaction,
}

/// Signs built transactions with a wallet's key
pub trait TransactionSigner: Send + Sync {
    fn sign(&self, built: &BuiltTransaction, wallet: &Wallet) -> Result<SignedTransaction>;
}

/// Signer for in-memory taproot and native segwit keys
pub struct LocalSigner {
    secp: Secp256k1<All>,
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSigner {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }

    fn witnesses(&self, built: &BuiltTransaction, wallet: &Wallet) -> Result<Vec<Witness>> {
        let prevouts = Prevouts::All(&built.prevouts);
        let mut cache = SighashCache::new(&built.tx);
        let owned_script = wallet.address.script_pubkey();
        let mut witnesses = Vec::with_capacity(built.tx.input.len());

        for (i, prevout) in built.prevouts.iter().enumerate() {
            if prevout.script_pubkey != owned_script {
                return Err(SnowballError::Signing(format!(
                    "input {} of {} {} is not owned by {}",
                    i, built.kind, built.index, wallet.address
                )));
            }

            let witness = match &wallet.key {
                WalletKey::Taproot { keypair } => {
                    let sighash = cache.taproot_key_spend_signature_hash(i, &prevouts, TapSighashType::Default)?;
                    let tweaked = keypair.tap_tweak(&self.secp, None);
                    let msg = Message::from(sighash);
                    let signature = self.secp.sign_schnorr_no_aux_rand(&msg, &tweaked.to_inner());
                    Witness::p2tr_key_spend(&taproot::Signature {
                        signature,
                        sighash_type: TapSighashType::Default,
                    })
                }
                WalletKey::NativeSegwit { secret_key, public_key } => {
                    let sighash = cache.p2wpkh_signature_hash(
                        i,
                        &prevout.script_pubkey,
                        prevout.value,
                        EcdsaSighashType::All,
                    )?;
                    let msg = Message::from(sighash);
                    let signature = self.secp.sign_ecdsa(&msg, secret_key);
                    Witness::p2wpkh(
                        &ecdsa::Signature {
                            signature,
                            sighash_type: EcdsaSighashType::All,
                        },
                        &public_key.0,
                    )
                }
            };
            witnesses.push(witness);
        }
        Ok(witnesses)
    }
}

impl TransactionSigner for LocalSigner {
    fn sign(&self, built: &BuiltTransaction, wallet: &Wallet) -> Result<SignedTransaction> {
        if built.prevouts.len() != built.tx.input.len() {
            return Err(SnowballError::Signing(format!(
                "{} prevouts for {} inputs",
                built.prevouts.len(),
                built.tx.input.len()
            )));
        }

        let witnesses = self.witnesses(built, wallet)?;
        let mut tx = built.tx.clone();
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        let txid = tx.compute_txid();
        if txid != built.expected_txid {
            return Err(SnowballError::Signing(format!(
                "signed txid {} differs from expected {}",
                txid, built.expected_txid
            )));
        }
        debug!("Signed {} {} as {}", built.kind, built.index, txid);

        Ok(SignedTransaction {
            txid,
            hex: serialize_hex(&tx),
            tx,
        })
    }
}
