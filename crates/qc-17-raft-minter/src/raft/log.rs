//! The consensus-log contract
//!
//! The raft implementation owns its own threads. This crate sees it as a
//! proposal sink, an ordered committed feed and a leadership watch.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Payload kind of a raft entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// An encoded block
    Normal,
    /// An encoded [`MembershipChange`]
    ConfChange,
}

/// A committed log entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// Cluster membership operation carried by a `ConfChange` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    AddPeer { raft_id: u64, address: String },
    RemovePeer { raft_id: u64 },
}

impl MembershipChange {
    pub fn raft_id(&self) -> u64 {
        match self {
            Self::AddPeer { raft_id, .. } | Self::RemovePeer { raft_id } => *raft_id,
        }
    }
}

/// Leadership as last observed by a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub leader: Option<u64>,
    pub term: u64,
}

/// Errors reported by the log itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftLogError {
    #[error("not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("proposal dropped before commit")]
    Dropped,

    #[error("raft log stopped")]
    Stopped,
}

/// Consensus log as seen by one node
#[async_trait]
pub trait RaftLog: Send + Sync {
    /// Raft id of the local node
    fn id(&self) -> u64;

    /// Propose an entry; resolves with its index once committed
    async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<u64, RaftLogError>;

    /// Committed entries with `index >= from`, in log order without gaps
    fn committed_from(&self, from: u64) -> mpsc::Receiver<RaftEntry>;

    /// Leadership changes visible to this node
    fn leader_watch(&self) -> watch::Receiver<LeaderState>;

    /// Stop taking proposals; pending ones from this node fail with `Stopped`
    fn stop(&self);
}
