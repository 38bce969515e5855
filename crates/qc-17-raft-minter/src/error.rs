//! Error types for the raft minter subsystem

use shared_types::StoreError;
use thiserror::Error;

use crate::raft::log::RaftLogError;

/// Result type alias for minter operations
pub type Result<T> = std::result::Result<T, MinterError>;

/// Errors that can occur while minting, proposing or applying blocks
#[derive(Debug, Error)]
pub enum MinterError {
    /// The raft log did not commit the proposal in time
    #[error("Proposal not committed within {timeout_ms}ms")]
    ProposalTimeout {
        /// Configured proposal timeout
        timeout_ms: u64,
    },

    /// The raft log discarded the proposal (term changed before commit)
    #[error("Proposal dropped by the raft log")]
    ProposalDropped,

    /// Only the leader may propose blocks
    #[error("Not the raft leader (leader: {leader:?})")]
    NotLeader {
        /// The leader this node currently knows of
        leader: Option<u64>,
    },

    /// A committed block does not extend the applied head
    #[error("Forked apply at height {height}: parent {parent} is not head {head}")]
    ForkedApply {
        /// Height of the offending block
        height: u64,
        /// Parent hash declared by the block (hex)
        parent: String,
        /// Current head hash (hex)
        head: String,
    },

    /// Executing a committed block produced a different state root
    #[error("State root mismatch at height {height}: declared {declared}, computed {computed}")]
    StateRootMismatch {
        /// Height of the offending block
        height: u64,
        /// State root carried by the block (hex)
        declared: String,
        /// State root produced by local execution (hex)
        computed: String,
    },

    /// A committed block carries a transaction that fails to execute
    #[error("Committed block {height} failed to execute: {reason}")]
    InvalidCommittedBlock {
        /// Height of the offending block
        height: u64,
        /// Why execution failed
        reason: String,
    },

    /// The committed feed was already handed to a consumer
    #[error("Committed channel already has a consumer")]
    CommittedChannelTaken,

    /// The raft log stopped
    #[error("Raft log stopped")]
    LogStopped,

    /// Block or entry bytes could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation attempted after stop
    #[error("Service stopped")]
    Stopped,
}

impl MinterError {
    /// Check if error is recoverable (the minter retries next tick)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProposalTimeout { .. } | Self::ProposalDropped | Self::NotLeader { .. }
        )
    }

    /// Check if error is fatal (consensus invariant broken; the node must abort)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ForkedApply { .. }
                | Self::StateRootMismatch { .. }
                | Self::InvalidCommittedBlock { .. }
                | Self::Storage(_)
        )
    }
}

impl From<rlp::DecoderError> for MinterError {
    fn from(err: rlp::DecoderError) -> Self {
        MinterError::Decode(err.to_string())
    }
}

impl From<RaftLogError> for MinterError {
    fn from(err: RaftLogError) -> Self {
        match err {
            RaftLogError::NotLeader { leader } => MinterError::NotLeader { leader },
            RaftLogError::Dropped => MinterError::ProposalDropped,
            RaftLogError::Stopped => MinterError::LogStopped,
        }
    }
}
