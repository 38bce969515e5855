//! Raft service
//!
//! Owns the protocol manager, the block applier and the minter, and runs
//! them as one unit for the node runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shared_bus::{EventPublisher, InMemoryEventBus};
use shared_types::entities::ChainHead;
use shared_types::KeyedCache;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::applier::BlockApplier;
use crate::config::RaftServiceConfig;
use crate::error::{MinterError, Result};
use crate::metrics::Metrics;
use crate::minter::{Minter, MinterDeps};
use crate::ports::{BlockStore, ChainReader, Executor, GasLimitFn, StateDb, TxPool};
use crate::raft::{MembershipChange, RaftLog, RaftProtocolManager, RaftRole};

/// External collaborators of a [`RaftService`]
pub struct RaftDeps {
    /// Consensus log of the local node
    pub log: Arc<dyn RaftLog>,
    /// Pending-transaction source
    pub pool: Arc<dyn TxPool>,
    /// Transaction execution engine
    pub executor: Arc<dyn Executor>,
    /// Canonical block persistence
    pub store: Arc<dyn BlockStore>,
    /// State the genesis block commits to
    pub genesis_state: Box<dyn StateDb>,
    /// Event bus shared with the rest of the node
    pub bus: Arc<InMemoryEventBus>,
    /// Optional gas-limit hook; `gas_floor` otherwise
    pub gas_limit: Option<GasLimitFn>,
}

/// Raft-ordered minting for one node
pub struct RaftService {
    manager: Arc<RaftProtocolManager>,
    applier: Arc<BlockApplier>,
    minter: Arc<Minter>,
    store: Arc<dyn BlockStore>,
    metrics: Arc<Metrics>,
    apply_cancel: CancellationToken,
    apply_task: Mutex<Option<JoinHandle<Result<()>>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RaftService {
    /// Build the service and recover the canonical chain from `deps.store`
    pub fn new(config: RaftServiceConfig, deps: RaftDeps) -> Result<Self> {
        config.validate()?;
        info!(
            raft_id = config.raft.raft_id,
            block_time_ms = config.minter.block_time_ms,
            peers = config.raft.peers.len(),
            "[qc-17] Initializing Raft Service"
        );

        let metrics = Arc::new(Metrics::new());
        let publisher: Arc<dyn EventPublisher> = Arc::clone(&deps.bus) as Arc<dyn EventPublisher>;
        let manager = Arc::new(RaftProtocolManager::new(
            deps.log,
            Arc::clone(&publisher),
            config.raft.clone(),
        ));
        let applier = Arc::new(
            BlockApplier::open(
                Arc::clone(&deps.store),
                Arc::clone(&deps.executor),
                Arc::clone(&deps.pool),
                publisher,
                Arc::new(KeyedCache::new(config.recent_block_cache)),
                deps.genesis_state,
                Arc::clone(&metrics),
            )?
            .with_membership(Arc::clone(&manager)),
        );
        let minter = Arc::new(Minter::new(
            config.minter.clone(),
            MinterDeps {
                pool: deps.pool,
                executor: deps.executor,
                proposer: Arc::clone(&manager) as Arc<dyn crate::ports::BlockProposer>,
                chain: Arc::clone(&applier) as Arc<dyn ChainReader>,
                bus: deps.bus,
                gas_limit: deps.gas_limit,
            },
            Arc::clone(&metrics),
        ));

        Ok(Self {
            manager,
            applier,
            minter,
            store: deps.store,
            metrics,
            apply_cancel: CancellationToken::new(),
            apply_task: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the leader observer, the apply loop and the minter. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MinterError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.manager.start();
        let feed = self.manager.committed(self.applier.applied_index())?;
        let applier = Arc::clone(&self.applier);
        let cancel = self.apply_cancel.clone();
        *self.apply_task.lock() = Some(tokio::spawn(applier.run(feed, cancel)));

        let is_leader = self.manager.is_leader();
        self.minter.start(is_leader);
        info!(
            raft_id = self.manager.id(),
            role = %self.role(),
            head = %self.head(),
            "[qc-17] Raft started"
        );
        Ok(())
    }

    /// Stop applier, protocol manager and minter, then flush. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.apply_cancel.cancel();
        let task = self.apply_task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "[qc-17] apply loop had stopped on error"),
                Err(err) => error!(%err, "[qc-17] apply loop panicked"),
            }
        }
        self.manager.stop().await;
        self.minter.stop().await;
        if let Err(err) = self.store.flush() {
            warn!(%err, "[qc-17] block store flush failed");
        }
        info!("[qc-17] Raft stopped");
    }

    /// `Minter` while leading, `Verifier` otherwise
    pub fn role(&self) -> RaftRole {
        self.manager.role()
    }

    /// Known leader
    pub fn leader(&self) -> Option<u64> {
        self.manager.leader()
    }

    /// Known cluster members by raft id
    pub fn cluster(&self) -> BTreeMap<u64, String> {
        self.manager.cluster()
    }

    /// Propose adding a member; returns the log index
    pub async fn add_peer(&self, raft_id: u64, address: impl Into<String>) -> Result<u64> {
        self.manager
            .propose_membership(&MembershipChange::AddPeer {
                raft_id,
                address: address.into(),
            })
            .await
    }

    /// Propose removing a member; returns the log index
    pub async fn remove_peer(&self, raft_id: u64) -> Result<u64> {
        self.manager
            .propose_membership(&MembershipChange::RemovePeer { raft_id })
            .await
    }

    /// Canonical head
    pub fn head(&self) -> ChainHead {
        self.applier.head()
    }

    pub fn applier(&self) -> &Arc<BlockApplier> {
        &self.applier
    }

    pub fn minter(&self) -> &Arc<Minter> {
        &self.minter
    }

    pub fn manager(&self) -> &Arc<RaftProtocolManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
