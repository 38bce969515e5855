//! # Quantum-Chain Node Runtime
//!
//! The main entry point for a Quantum-Chain node.
//!
//! ## Subsystems
//!
//! ```text
//!   TxPool ──► Raft Minter (17) ──NewHead/LeaderChanged──► Event Bus
//!                                                              │
//!   peers ◄──streams──► Chunk Sync (5) ───PeerDropped──────────┘
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults, `QC_CONFIG` file, `QC_*` environment)
//! 2. Open the key-value store
//! 3. Build the raft minter and the chunk-sync registry
//! 4. Start the raft service
//! 5. Run until Ctrl+C or a critical error on the bus
//!
//! ## Shutdown Sequence
//!
//! 1. Close the registry (drops every peer, keeps intervals)
//! 2. Stop the raft service (applier, protocol manager, minter)
//! 3. Flush the key-value store

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use node_runtime::telemetry::init_tracing;
use node_runtime::{NodeConfig, SubsystemContainer};
use shared_bus::{BlockchainEvent, EventFilter, EventTopic};

/// The main node runtime orchestrating both subsystems.
pub struct NodeRuntime {
    container: Arc<SubsystemContainer>,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig) -> Result<Self> {
        info!("Creating Quantum-Chain node runtime");
        let container = SubsystemContainer::new(config).context("Failed to build subsystems")?;
        Ok(Self {
            container: Arc::new(container),
        })
    }

    pub fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Quantum-Chain Node Runtime v0.1.0");
        info!("  Raft Minter (17) + Chunk Sync (5)");
        info!("===========================================");

        self.container
            .raft
            .start()
            .context("Failed to start raft service")?;

        let config = &self.container.config;
        info!(data_dir = ?config.storage.data_dir, "Data Dir");
        info!(
            role = %self.container.raft.role(),
            overlay = %self.container.registry.local(),
            syncing = ?config.sync.syncing,
            "Node is running"
        );
        Ok(())
    }

    /// Resolve on Ctrl+C or the first critical error published on the bus
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut critical = self
            .container
            .event_bus
            .subscribe(EventFilter::topics(vec![EventTopic::DeadLetterQueue]));
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Shutdown signal received");
            }
            event = critical.recv() => match event {
                Some(BlockchainEvent::CriticalError { subsystem_id, error }) => {
                    error!(subsystem_id, %error, "Critical error, shutting down");
                }
                other => warn!(?other, "Critical-error subscription ended"),
            },
        }
        Ok(())
    }

    /// Shutdown the node gracefully.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.container.registry.close().await;
        self.container.raft.stop().await;
        if let Err(err) = self.container.kv.flush() {
            warn!(%err, "Key-value store flush failed");
        }
        info!("Shutdown complete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = NodeConfig::load().context("Failed to load configuration")?;
    let runtime = NodeRuntime::new(config)?;
    runtime.start()?;

    info!("Press Ctrl+C to stop.");
    let outcome = runtime.wait_for_shutdown().await;
    runtime.shutdown().await;
    outcome
}
