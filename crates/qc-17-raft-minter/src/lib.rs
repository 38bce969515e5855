//! # Quantum Chain - Raft Minter (Subsystem 17)
//!
//! **Bounded Context:** Ordered block production
//!
//! ## Purpose
//!
//! Replaces proof-of-work sealing with a leader-elected log. The raft
//! leader batches pending transactions into blocks and proposes them; every
//! replica applies committed blocks in log order.
//!
//! ## Architecture
//!
//! ```text
//!   TxPool ──► Minter ──propose──► RaftProtocolManager ──► RaftLog
//!                ▲                        │
//!                │ NewHead / LeaderChanged│ committed feed (single consumer)
//!                │                        ▼
//!            Event Bus ◄──── publish ── BlockApplier ──► BlockStore, StateDb
//! ```
//!
//! The applier is the only writer of canonical state and the head. The
//! minter reads both through [`ports::ChainReader`] snapshots and reacts to
//! bus events, which breaks the minter/applier cycle.
//!
//! ## Module Structure
//!
//! - [`domain`]: blocks, encoding, speculative chain
//! - [`ports`]: pool, state, executor, block store, proposer interfaces
//! - [`raft`]: log contract, in-process cluster, protocol manager
//! - [`applier`]: committed-entry consumer
//! - [`minter`]: leader-bound minting
//! - [`service`]: lifecycle of the three together
//! - [`adapters`]: in-memory and key-value backed port implementations

#![warn(clippy::all)]

pub mod adapters;
pub mod applier;
pub mod domain;
pub mod minter;
pub mod ports;
pub mod raft;
pub mod service;

mod config;
mod error;
mod metrics;

pub use config::{MinterConfig, PeerAddress, RaftConfig, RaftServiceConfig};
pub use error::{MinterError, Result};
pub use metrics::{Metrics, MetricsSnapshot};

pub use applier::{ApplyOutcome, BlockApplier};
pub use domain::{Block, PruneOutcome, SpeculativeChain};
pub use minter::{fixed_gas_limit, Minter, MinterDeps};
pub use raft::{
    EntryKind, InMemoryRaftCluster, LeaderState, LocalRaftNode, MembershipChange, RaftEntry,
    RaftLog, RaftLogError, RaftProtocolManager, RaftRole,
};
pub use service::{RaftDeps, RaftService};

/// Subsystem identifier on the event bus
pub const SUBSYSTEM_ID: u8 = 17;

/// Default block gas limit (30 million gas)
pub const DEFAULT_GAS_LIMIT: u64 = 30_000_000;

/// Default interval between mint attempts
pub const DEFAULT_BLOCK_TIME_MS: u64 = 50;

/// Default bound on waiting for a proposal to commit
pub const DEFAULT_PROPOSAL_TIMEOUT_MS: u64 = 2_000;

/// Maximum transactions per minted block
pub const MAX_TRANSACTION_CANDIDATES: usize = 10_000;

/// Default number of recently applied blocks kept in memory
pub const DEFAULT_RECENT_BLOCKS: usize = 128;
