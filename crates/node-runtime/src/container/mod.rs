//! # Subsystem Container
//!
//! Configuration plus the container holding the raft minter, the
//! chunk-sync registry and their shared infrastructure.

pub mod config;
pub mod subsystems;

pub use config::{ConfigError, GenesisAccount, NodeConfig, NodeSection, StorageConfig};
pub use subsystems::SubsystemContainer;
