//! Application configuration
//!
//! Settings live in `<data_dir>/config.json`; every field has a default, so a
//! missing or partial file is fine. Orders are stored under `<data_dir>/store`.

use bitcoin::Network;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::broadcast::BroadcastConfig;
use crate::error::{Result, SnowballError};
use crate::order::manager::DEFAULT_MAX_RECOVERY_ATTEMPTS;
use crate::rpc::RpcConfig;
use crate::verify::VerifyConfig;

pub const CONFIG_FILE: &str = "config.json";
const DATA_DIR_NAME: &str = ".snowball";
const STORE_DIR: &str = "store";

/// Defaults applied to new orders when the command line leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderDefaults {
    /// Used when neither the command line nor the fee estimator gives a rate
    pub fee_rate: u64,
    pub mints_per_slice: u32,
    pub max_concurrent_slices: usize,
    /// Blocks the fee estimator targets
    pub confirmation_target: u16,
}

impl Default for OrderDefaults {
    fn default() -> Self {
        Self {
            fee_rate: 10,
            mints_per_slice: 25,
            max_concurrent_slices: 4,
            confirmation_target: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// mainnet, testnet, signet or regtest
    pub network: String,
    pub rpc: RpcConfig,
    pub broadcast: BroadcastConfig,
    pub verify: VerifyConfig,
    pub max_recovery_attempts: u32,
    pub defaults: OrderDefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: "regtest".to_string(),
            rpc: RpcConfig::default(),
            broadcast: BroadcastConfig::default(),
            verify: VerifyConfig::default(),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            defaults: OrderDefaults::default(),
        }
    }
}

/// Map a network name to a `Network`
pub fn parse_network(name: &str) -> Result<Network> {
    match name.to_lowercase().as_str() {
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" | "localhost" => Ok(Network::Regtest),
        other => Err(SnowballError::Validation(format!(
            "unknown network '{}'; expected mainnet, testnet, signet or regtest",
            other
        ))),
    }
}

/// `~/.snowball`, or `./.snowball` when no home directory is known
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

/// Expand a leading `~/`
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(STORE_DIR)
}

impl AppConfig {
    pub fn network(&self) -> Result<Network> {
        parse_network(&self.network)
    }

    /// Read `<data_dir>/config.json`, falling back to defaults when it does not exist
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let config: AppConfig = serde_json::from_str(&raw)
                    .map_err(|e| SnowballError::Validation(format!("invalid config {}: {}", path.display(), e)))?;
                debug!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SnowballError::Storage(format!("failed to read {}: {}", path.display(), e))),
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Wrote configuration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.network().unwrap(), Network::Regtest);
        assert_eq!(config.max_recovery_attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"network": "signet", "rpc": {"esplora_url": "http://esplora:3000"}}"#,
        )
        .unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.network().unwrap(), Network::Signet);
        assert_eq!(config.rpc.esplora_url, "http://esplora:3000");
        assert_eq!(config.rpc.timeout_secs, RpcConfig::default().timeout_secs);
        assert_eq!(config.defaults.mints_per_slice, 25);
    }

    #[test]
    fn test_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.broadcast.max_retries = 9;
        config.save(dir.path()).unwrap();
        assert_eq!(AppConfig::load(dir.path()).unwrap().broadcast.max_retries, 9);
    }

    #[test]
    fn test_unknown_network() {
        assert!(parse_network("dogecoin").is_err());
        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
    }
}
