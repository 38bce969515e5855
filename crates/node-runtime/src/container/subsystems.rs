//! # Subsystem Container
//!
//! Holds both subsystems of a node and the infrastructure they share.
//!
//! ## Initialization Order
//!
//! ```text
//! Level 0: key-value store, event bus
//! Level 1: block store, chunk store, interval store (all over the kv store)
//! Level 2: Raft Minter (17), Chunk Sync registry (5)
//! ```
//!
//! The raft log is the in-process cluster; this node bootstraps it as the
//! sole member and leader unless `join_existing` is set.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use qc_05_chunk_sync::{ChunkStore, KvChunkStore, Registry};
use qc_17_raft_minter::adapters::{InMemoryStateDb, InMemoryTxPool, KvBlockStore, TransferExecutor};
use qc_17_raft_minter::{InMemoryRaftCluster, RaftDeps, RaftService};
use shared_bus::InMemoryEventBus;
use shared_types::KeyValueStore;

use crate::adapters::open_store;
use crate::container::config::NodeConfig;

/// Central container holding all subsystem instances.
pub struct SubsystemContainer {
    /// Raft Minter (Subsystem 17)
    pub raft: Arc<RaftService>,

    /// Chunk Sync registry (Subsystem 5)
    pub registry: Arc<Registry>,

    /// Pending transactions fed to the minter
    pub pool: Arc<InMemoryTxPool>,

    /// Raft log shared with in-process members
    pub cluster: InMemoryRaftCluster,

    /// Event Bus for inter-subsystem communication.
    pub event_bus: Arc<InMemoryEventBus>,

    /// Key-value store under every persistent component
    pub kv: Arc<dyn KeyValueStore>,

    /// Node configuration (immutable after initialization).
    pub config: NodeConfig,
}

impl SubsystemContainer {
    /// Open storage and build both subsystems; nothing is started yet
    #[instrument(skip(config), fields(raft_id = config.raft.raft.raft_id))]
    pub fn new(config: NodeConfig) -> Result<Self> {
        let kv = open_store(&config.storage).context("Failed to open key-value store")?;
        Self::with_store(config, kv)
    }

    /// Build both subsystems over an already opened store
    pub fn with_store(config: NodeConfig, kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let event_bus = Arc::new(InMemoryEventBus::new());
        let raft_id = config.raft.raft.raft_id;

        let cluster = InMemoryRaftCluster::new();
        let log = cluster.add_node(raft_id);
        if !config.raft.raft.join_existing {
            cluster.elect(raft_id);
        }

        let pool = Arc::new(InMemoryTxPool::new());
        let genesis = config.genesis_balances().context("Invalid genesis accounts")?;
        let raft = RaftService::new(
            config.raft.clone(),
            RaftDeps {
                log,
                pool: Arc::clone(&pool) as _,
                executor: Arc::new(TransferExecutor),
                store: Arc::new(KvBlockStore::new(Arc::clone(&kv))),
                genesis_state: Box::new(InMemoryStateDb::with_balances(&genesis)),
                bus: Arc::clone(&event_bus),
                gas_limit: None,
            },
        )
        .context("Failed to build raft service")?;
        info!(raft_id, head = %raft.head(), "[qc-17] Raft Minter initialized");

        let overlay = config.overlay().context("Invalid overlay address")?;
        let chunks: Arc<dyn ChunkStore> = Arc::new(
            KvChunkStore::open(Arc::clone(&kv), overlay).context("Failed to open chunk store")?,
        );
        let registry = Registry::new(config.sync.clone(), chunks, Arc::clone(&kv), event_bus.clone())
            .context("Failed to build chunk-sync registry")?;
        info!(%overlay, "[qc-05] Chunk Sync initialized");

        Ok(Self {
            raft: Arc::new(raft),
            registry,
            pool,
            cluster,
            event_bus,
            kv,
            config,
        })
    }
}
