//! # Storage Backends
//!
//! With the `rocksdb` feature the node persists into `data_dir`; without
//! it every store lives in memory and is lost on exit.

#[cfg(feature = "rocksdb")]
pub mod rocksdb_adapter;

#[cfg(feature = "rocksdb")]
pub use rocksdb_adapter::{RocksDbConfig, RocksDbStore};

use std::path::Path;
use std::sync::Arc;

use shared_types::{KeyValueStore, StoreError};
use tracing::{info, warn};

use crate::container::config::StorageConfig;

/// Open the key-value store every subsystem shares
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    #[cfg(feature = "rocksdb")]
    {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| StoreError::io(format!("cannot create {:?}: {}", config.data_dir, e)))?;
        check_disk_space(&config.data_dir, config.min_disk_space_percent);
        let store = RocksDbStore::open(RocksDbConfig {
            path: config.data_dir.join("rocksdb"),
            sync_writes: config.sync_writes,
            ..RocksDbConfig::default()
        })?;
        info!(path = ?config.data_dir, "Opened RocksDB store");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "rocksdb"))]
    {
        warn!(
            data_dir = ?config.data_dir,
            "Built without the rocksdb feature; using an in-memory store"
        );
        Ok(Arc::new(shared_types::InMemoryKVStore::new()))
    }
}

/// Free space on the volume holding `path`, in percent
pub fn available_disk_space_percent(path: &Path) -> Result<u8, StoreError> {
    let available = fs2::available_space(path).map_err(|e| StoreError::io(e.to_string()))?;
    let total = fs2::total_space(path).map_err(|e| StoreError::io(e.to_string()))?;
    if total == 0 {
        return Err(StoreError::io("Unable to determine disk space"));
    }
    Ok(((available as f64 / total as f64) * 100.0) as u8)
}

/// Warn when the data volume is nearly full
pub fn check_disk_space(path: &Path, min_percent: u8) {
    match available_disk_space_percent(path) {
        Ok(percent) if percent < min_percent => {
            warn!(?path, percent, min_percent, "Low disk space on data volume")
        }
        Ok(percent) => info!(?path, percent, "Data volume free space"),
        Err(err) => warn!(?path, %err, "Cannot read free disk space"),
    }
}
