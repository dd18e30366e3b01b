//! Key derivation for funding and relay wallets
//!
//! This module handles:
//! - Restoring the master key from a BIP39 mnemonic
//! - Deriving the funding wallet (BIP86 taproot or BIP84 native segwit)
//! - Deriving relay wallets on a dedicated account so relay keys never collide
//!   with funding keys
//!
//! Only key kinds whose txids do not depend on the witness are produced here,
//! which is what lets a chain compute every txid before anything is signed.

use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, Keypair, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network};
use log::{debug, info};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SnowballError};
use crate::types::AddressType;

/// Account used for relay wallet derivation (`m/84'/coin'/1'/0/i`)
pub const RELAY_ACCOUNT: u32 = 1;

/// Signing material for a wallet
#[derive(Clone, Copy)]
pub enum WalletKey {
    /// BIP86 key-path spend; the keypair is the untweaked internal key
    Taproot { keypair: Keypair },
    /// BIP84 single key
    NativeSegwit {
        secret_key: SecretKey,
        public_key: CompressedPublicKey,
    },
}

impl WalletKey {
    pub fn address_type(&self) -> AddressType {
        match self {
            WalletKey::Taproot { .. } => AddressType::Taproot,
            WalletKey::NativeSegwit { .. } => AddressType::NativeSegwit,
        }
    }
}

/// A derived address together with the key that spends from it
#[derive(Clone)]
pub struct Wallet {
    pub address: Address,
    pub address_type: AddressType,
    pub derivation_index: u32,
    pub key: WalletKey,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address.to_string())
            .field("address_type", &self.address_type)
            .field("derivation_index", &self.derivation_index)
            .finish_non_exhaustive()
    }
}

/// Wallets one chain needs: who pays, who relays, who receives
#[derive(Debug, Clone)]
pub struct ChainWallets {
    pub funding: Wallet,
    pub relay: Wallet,
    pub final_receiver: Address,
}

impl ChainWallets {
    pub fn final_receiver_type(&self) -> Result<AddressType> {
        AddressType::of(&self.final_receiver)
    }
}

/// Deterministic wallet source backed by one master key
pub struct WalletPool {
    secp: Secp256k1<All>,
    master_xprv: Xpriv,
    network: Network,
}

impl WalletPool {
    /// Restore the pool from a mnemonic phrase
    pub fn from_mnemonic(phrase: &str, network: Network) -> Result<Self> {
        let mnemonic = Mnemonic::parse(phrase.trim())
            .map_err(|e| SnowballError::Validation(format!("invalid mnemonic phrase: {}", e)))?;
        let seed = mnemonic.to_seed("");
        let master_xprv = Xpriv::new_master(network, &seed)
            .map_err(|e| SnowballError::Signing(format!("failed to create master key: {}", e)))?;
        info!("Wallet pool restored for {}", network);
        Ok(Self {
            secp: Secp256k1::new(),
            master_xprv,
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn coin_type(&self) -> u32 {
        match self.network {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    fn derive_secret(&self, path: &str) -> Result<SecretKey> {
        let path = DerivationPath::from_str(path)
            .map_err(|e| SnowballError::Signing(format!("invalid derivation path {}: {}", path, e)))?;
        let derived = self
            .master_xprv
            .derive_priv(&self.secp, &path)
            .map_err(|e| SnowballError::Signing(format!("failed to derive {}: {}", path, e)))?;
        Ok(derived.private_key)
    }

    fn taproot_wallet(&self, path: &str, index: u32) -> Result<Wallet> {
        let secret = self.derive_secret(path)?;
        let keypair = Keypair::from_secret_key(&self.secp, &secret);
        let (internal_key, _) = keypair.x_only_public_key();
        let address = Address::p2tr(&self.secp, internal_key, None, self.network);
        debug!("Derived taproot wallet {} at {}", address, path);
        Ok(Wallet {
            address,
            address_type: AddressType::Taproot,
            derivation_index: index,
            key: WalletKey::Taproot { keypair },
        })
    }

    fn segwit_wallet(&self, path: &str, index: u32) -> Result<Wallet> {
        let secret_key = self.derive_secret(path)?;
        let public_key = CompressedPublicKey(secret_key.public_key(&self.secp));
        let address = Address::p2wpkh(&public_key, self.network);
        debug!("Derived native segwit wallet {} at {}", address, path);
        Ok(Wallet {
            address,
            address_type: AddressType::NativeSegwit,
            derivation_index: index,
            key: WalletKey::NativeSegwit { secret_key, public_key },
        })
    }

    /// Funding wallet of the requested type at index 0 of the receive chain
    pub fn funding_wallet(&self, address_type: AddressType) -> Result<Wallet> {
        let coin = self.coin_type();
        match address_type {
            AddressType::Taproot => self.taproot_wallet(&format!("m/86'/{}'/0'/0/0", coin), 0),
            AddressType::NativeSegwit => self.segwit_wallet(&format!("m/84'/{}'/0'/0/0", coin), 0),
            other => Err(SnowballError::InvalidAddressType(format!(
                "{} funding wallets cannot sign chain transactions",
                other
            ))),
        }
    }

    /// Native segwit relay wallet at `index` on the relay account
    pub fn relay_wallet(&self, index: u32) -> Result<Wallet> {
        let path = format!("m/84'/{}'/{}'/0/{}", self.coin_type(), RELAY_ACCOUNT, index);
        self.segwit_wallet(&path, index)
    }

    /// Assemble the wallets for one chain
    pub fn chain_wallets(
        &self,
        funding_type: AddressType,
        relay_index: u32,
        final_receiver: Address,
    ) -> Result<ChainWallets> {
        Ok(ChainWallets {
            funding: self.funding_wallet(funding_type)?,
            relay: self.relay_wallet(relay_index)?,
            final_receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_derivation_is_deterministic() {
        let a = WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap();
        let b = WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap();
        assert_eq!(a.relay_wallet(7).unwrap().address, b.relay_wallet(7).unwrap().address);
        assert_ne!(a.relay_wallet(7).unwrap().address, a.relay_wallet(8).unwrap().address);
    }

    #[test]
    fn test_wallet_types() {
        let pool = WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap();
        let funding = pool.funding_wallet(AddressType::Taproot).unwrap();
        assert_eq!(AddressType::of(&funding.address).unwrap(), AddressType::Taproot);
        assert_eq!(funding.key.address_type(), AddressType::Taproot);

        let relay = pool.relay_wallet(0).unwrap();
        assert_eq!(relay.address_type, AddressType::NativeSegwit);
        assert_ne!(relay.address, pool.funding_wallet(AddressType::NativeSegwit).unwrap().address);
    }

    #[test]
    fn test_unsigned_types_rejected() {
        let pool = WalletPool::from_mnemonic(PHRASE, Network::Regtest).unwrap();
        let err = pool.funding_wallet(AddressType::Legacy).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidAddressType);
        assert!(pool.funding_wallet(AddressType::NestedSegwit).is_err());
    }

    #[test]
    fn test_bad_mnemonic() {
        assert!(WalletPool::from_mnemonic("not a real phrase", Network::Regtest).is_err());
    }
}
