//! # Node Configuration
//!
//! Built in three layers, each overriding the last:
//!
//! 1. compiled defaults
//! 2. a TOML file named by `QC_CONFIG` (optional)
//! 3. environment overrides: `QC_RAFT_ID`, `QC_BLOCK_TIME_MS`,
//!    `QC_DATA_DIR`, `QC_SKIP_CHECK`
//!
//! ```toml
//! [storage]
//! data_dir = "/var/lib/qc"
//!
//! [raft.minter]
//! block_time_ms = 50
//!
//! [sync]
//! syncing = "AutoSubscribe"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use qc_05_chunk_sync::RegistryOptions;
use qc_17_raft_minter::RaftServiceConfig;
use serde::Deserialize;
use shared_types::{chunk_address, Address, NodeId, U256};
use thiserror::Error;

/// Names of the environment variables the loader reads
pub const ENV_CONFIG: &str = "QC_CONFIG";
pub const ENV_RAFT_ID: &str = "QC_RAFT_ID";
pub const ENV_BLOCK_TIME_MS: &str = "QC_BLOCK_TIME_MS";
pub const ENV_DATA_DIR: &str = "QC_DATA_DIR";
pub const ENV_SKIP_CHECK: &str = "QC_SKIP_CHECK";

/// Complete node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Raft minter configuration.
    pub raft: RaftServiceConfig,
    /// Chunk-sync registry configuration.
    pub sync: RegistryOptions,
    /// Overlay identity and pre-funded accounts.
    pub node: NodeSection,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the key-value store.
    pub data_dir: PathBuf,
    /// Free-space percentage below which startup warns.
    pub min_disk_space_percent: u8,
    /// fsync every write (RocksDB backend only).
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            min_disk_space_percent: 5,
            sync_writes: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Overlay address as 64 hex chars; derived from the raft id if unset
    pub overlay: Option<String>,
    /// Accounts funded in the genesis state
    pub genesis: Vec<GenesisAccount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisAccount {
    /// 40 hex chars, optional `0x`
    pub address: String,
    pub balance: u64,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("cannot parse config file: {0}")]
    Parse(String),

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Defaults, then `QC_CONFIG`, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|var| std::env::var(var).ok())
    }

    /// Like [`NodeConfig::load`], with environment lookups supplied by `env`
    pub fn load_with<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match env(ENV_CONFIG) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `QC_*` overrides
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env(ENV_RAFT_ID) {
            let id = parse_env(ENV_RAFT_ID, value)?;
            self.raft.raft.raft_id = id;
            self.raft.minter.minter_id = id;
        }
        if let Some(value) = env(ENV_BLOCK_TIME_MS) {
            self.raft.minter.block_time_ms = parse_env(ENV_BLOCK_TIME_MS, value)?;
        }
        if let Some(value) = env(ENV_DATA_DIR) {
            if value.is_empty() {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_DATA_DIR,
                    value,
                });
            }
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env(ENV_SKIP_CHECK) {
            self.sync.skip_check = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_SKIP_CHECK,
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    /// Reject inconsistent or unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.raft
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.sync
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.storage.min_disk_space_percent > 100 {
            return Err(ConfigError::Invalid(
                "min_disk_space_percent must be at most 100".into(),
            ));
        }
        self.overlay()?;
        self.genesis_balances()?;
        Ok(())
    }

    /// Overlay address of this node
    pub fn overlay(&self) -> Result<NodeId, ConfigError> {
        match &self.node.overlay {
            Some(hex_id) => {
                let bytes = decode_hex::<32>(hex_id)
                    .ok_or_else(|| ConfigError::Invalid(format!("overlay {hex_id:?} is not 32 hex bytes")))?;
                Ok(NodeId::new(bytes))
            }
            None => Ok(NodeId::new(chunk_address(
                &self.raft.raft.raft_id.to_be_bytes(),
            ))),
        }
    }

    /// Genesis balances as typed addresses
    pub fn genesis_balances(&self) -> Result<Vec<(Address, U256)>, ConfigError> {
        self.node
            .genesis
            .iter()
            .map(|account| {
                let address = decode_hex::<20>(&account.address).ok_or_else(|| {
                    ConfigError::Invalid(format!("genesis address {:?} is not 20 hex bytes", account.address))
                })?;
                Ok((address, U256::from(account.balance)))
            })
            .collect()
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

fn decode_hex<const N: usize>(value: &str) -> Option<[u8; N]> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(value).ok()?.try_into().ok()
}
