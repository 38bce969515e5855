//! Consensus log integration
//!
//! - [`log`]: the contract a raft implementation must satisfy
//! - [`memory`]: an in-process cluster implementing it
//! - [`manager`]: the protocol manager the minter and applier talk to

pub mod log;
pub mod manager;
pub mod memory;

pub use log::{EntryKind, LeaderState, MembershipChange, RaftEntry, RaftLog, RaftLogError};
pub use manager::{RaftProtocolManager, RaftRole};
pub use memory::{InMemoryRaftCluster, LocalRaftNode};
