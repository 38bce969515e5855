//! Raft protocol manager
//!
//! Surfaces the consensus log as a single-producer proposal API with a
//! bounded wait, a single-consumer ordered committed feed, and leadership
//! notifications on the event bus. It also keeps the membership view that
//! committed `ConfChange` entries build up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_bus::{BlockchainEvent, EventPublisher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log::{EntryKind, LeaderState, MembershipChange, RaftEntry, RaftLog};
use crate::config::RaftConfig;
use crate::domain::{encode_block, Block};
use crate::error::{MinterError, Result};
use crate::ports::BlockProposer;

/// Raft role of the local node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftRole {
    /// Leader; mints blocks
    Minter,
    /// Follower; only applies blocks
    Verifier,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minter => f.write_str("minter"),
            Self::Verifier => f.write_str("verifier"),
        }
    }
}

/// Wraps a [`RaftLog`] for the minter and applier
pub struct RaftProtocolManager {
    log: Arc<dyn RaftLog>,
    bus: Arc<dyn EventPublisher>,
    config: RaftConfig,
    members: RwLock<BTreeMap<u64, String>>,
    committed_taken: AtomicBool,
    cancel: CancellationToken,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl RaftProtocolManager {
    pub fn new(log: Arc<dyn RaftLog>, bus: Arc<dyn EventPublisher>, config: RaftConfig) -> Self {
        let members = config
            .peers
            .iter()
            .map(|peer| (peer.raft_id, peer.address.clone()))
            .collect();
        Self {
            log,
            bus,
            config,
            members: RwLock::new(members),
            committed_taken: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            observer: Mutex::new(None),
        }
    }

    /// Raft id of the local node
    pub fn id(&self) -> u64 {
        self.log.id()
    }

    /// Spawn the leadership observer.
    ///
    /// Every observed change is published as `LeaderChanged`.
    pub fn start(&self) {
        let mut observer = self.observer.lock();
        if observer.is_some() {
            return;
        }
        let mut leader_rx = self.log.leader_watch();
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.clone();
        let id = self.log.id();
        *observer = Some(tokio::spawn(async move {
            let mut last = LeaderState::default();
            loop {
                let current = *leader_rx.borrow_and_update();
                if current != last {
                    info!(
                        node = id,
                        leader = ?current.leader,
                        term = current.term,
                        "[qc-17] leader changed"
                    );
                    bus.publish(BlockchainEvent::LeaderChanged {
                        leader: current.leader,
                        term: current.term,
                    })
                    .await;
                    last = current;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(node = id, "[qc-17] leader observer exited");
        }));
    }

    /// Propose a block, bounded by the proposal timeout
    pub async fn propose_block(&self, block: &Block) -> Result<u64> {
        self.propose(EntryKind::Normal, encode_block(block)).await
    }

    /// Propose a membership change, bounded by the proposal timeout
    pub async fn propose_membership(&self, change: &MembershipChange) -> Result<u64> {
        self.propose(EntryKind::ConfChange, rlp::encode(change).to_vec())
            .await
    }

    async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(MinterError::Stopped);
        }
        let timeout = self.config.proposal_timeout();
        match tokio::time::timeout(timeout, self.log.propose(kind, data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MinterError::ProposalTimeout {
                timeout_ms: self.config.proposal_timeout_ms,
            }),
        }
    }

    /// Hand out the committed feed, starting after `last_applied`.
    ///
    /// Only one consumer may exist for the lifetime of the manager.
    pub fn committed(&self, last_applied: u64) -> Result<mpsc::Receiver<RaftEntry>> {
        if self.committed_taken.swap(true, Ordering::SeqCst) {
            return Err(MinterError::CommittedChannelTaken);
        }
        Ok(self.log.committed_from(last_applied + 1))
    }

    /// Apply a committed membership entry to the local view
    pub fn apply_membership(&self, entry: &RaftEntry) -> Result<MembershipChange> {
        let change: MembershipChange = rlp::decode(&entry.data)?;
        let mut members = self.members.write();
        match &change {
            MembershipChange::AddPeer { raft_id, address } => {
                info!(raft_id, address = %address, index = entry.index, "[qc-17] peer added");
                members.insert(*raft_id, address.clone());
            }
            MembershipChange::RemovePeer { raft_id } => {
                if members.remove(raft_id).is_none() {
                    warn!(raft_id, "[qc-17] removing unknown peer");
                } else {
                    info!(raft_id, index = entry.index, "[qc-17] peer removed");
                }
            }
        }
        Ok(change)
    }

    /// Whether the local node currently leads
    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.log.id())
    }

    /// Known leader, if any
    pub fn leader(&self) -> Option<u64> {
        self.log.leader_watch().borrow().leader
    }

    /// Current leadership snapshot
    pub fn leader_state(&self) -> LeaderState {
        *self.log.leader_watch().borrow()
    }

    /// Role of the local node
    pub fn role(&self) -> RaftRole {
        if self.is_leader() {
            RaftRole::Minter
        } else {
            RaftRole::Verifier
        }
    }

    /// Known cluster members
    pub fn cluster(&self) -> BTreeMap<u64, String> {
        self.members.read().clone()
    }

    /// Stop the observer and the underlying log. Idempotent.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.log.stop();
        let handle = self.observer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl BlockProposer for RaftProtocolManager {
    async fn propose_block(&self, block: &Block) -> Result<u64> {
        RaftProtocolManager::propose_block(self, block).await
    }
}
