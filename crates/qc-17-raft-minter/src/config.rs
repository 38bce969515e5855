//! Configuration types for the raft minter

use serde::Deserialize;
use std::time::Duration;

/// Minting configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MinterConfig {
    /// Raft id of this node; stamped into minted blocks
    pub minter_id: u64,

    /// Interval between mint attempts in milliseconds
    pub block_time_ms: u64,

    /// Upper bound on transactions per block
    pub max_block_transactions: usize,

    /// Gas budget used when no gas-limit hook is supplied
    pub gas_floor: u64,
}

impl Default for MinterConfig {
    fn default() -> Self {
        Self {
            minter_id: 1,
            block_time_ms: crate::DEFAULT_BLOCK_TIME_MS,
            max_block_transactions: crate::MAX_TRANSACTION_CANDIDATES,
            gas_floor: crate::DEFAULT_GAS_LIMIT,
        }
    }
}

impl MinterConfig {
    /// Mint tick interval
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }
}

/// A raft cluster member
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PeerAddress {
    /// Raft id of the member
    pub raft_id: u64,
    /// Transport address (opaque to this crate)
    pub address: String,
}

/// Raft membership and proposal configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Raft id of this node
    pub raft_id: u64,

    /// Join an existing cluster instead of bootstrapping one
    pub join_existing: bool,

    /// Initial cluster members
    pub peers: Vec<PeerAddress>,

    /// How long a proposal may wait for commit, in milliseconds
    pub proposal_timeout_ms: u64,

    /// Capacity of the committed-entry channel
    pub committed_buffer: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            raft_id: 1,
            join_existing: false,
            peers: Vec::new(),
            proposal_timeout_ms: crate::DEFAULT_PROPOSAL_TIMEOUT_MS,
            committed_buffer: 256,
        }
    }
}

impl RaftConfig {
    /// Proposal commit timeout
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
}

/// Combined configuration for [`RaftService`](crate::service::RaftService)
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RaftServiceConfig {
    /// Minting settings
    pub minter: MinterConfig,
    /// Raft settings
    pub raft: RaftConfig,
    /// Recently applied blocks kept in memory
    pub recent_block_cache: usize,
}

impl Default for RaftServiceConfig {
    fn default() -> Self {
        Self {
            minter: MinterConfig::default(),
            raft: RaftConfig::default(),
            recent_block_cache: crate::DEFAULT_RECENT_BLOCKS,
        }
    }
}

impl RaftServiceConfig {
    /// Check cross-field consistency
    pub fn validate(&self) -> crate::Result<()> {
        if self.minter.block_time_ms == 0 {
            return Err(crate::MinterError::InvalidConfig(
                "block_time_ms must be positive".into(),
            ));
        }
        if self.raft.proposal_timeout_ms == 0 {
            return Err(crate::MinterError::InvalidConfig(
                "proposal_timeout_ms must be positive".into(),
            ));
        }
        if self.minter.minter_id != self.raft.raft_id {
            return Err(crate::MinterError::InvalidConfig(format!(
                "minter_id {} differs from raft_id {}",
                self.minter.minter_id, self.raft.raft_id
            )));
        }
        Ok(())
    }
}
