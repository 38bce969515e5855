//! # Node Events
//!
//! Defines all event types that flow through the shared bus between the
//! raft minter (qc-17), the chunk-sync streamer (qc-05) and the runtime.

use serde::{Deserialize, Serialize};
use shared_types::entities::{ChainHead, PeerId};

/// All events that can be published to the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockchainEvent {
    // =========================================================================
    // SUBSYSTEM 17: RAFT MINTER
    // =========================================================================
    /// The applier advanced the canonical head.
    /// Source: applier | Target: minter, runtime
    NewHead {
        /// The new head.
        head: ChainHead,
        /// Number of transactions in the applied block.
        tx_count: usize,
        /// Raft id of the node that minted the block.
        minter_id: u64,
    },

    /// Raft leadership moved (or was lost when `leader` is `None`).
    /// Source: protocol manager | Target: minter
    LeaderChanged {
        /// Raft id of the new leader.
        leader: Option<u64>,
        /// Raft term in which the leader was observed.
        term: u64,
    },

    /// Chain catch-up started or finished; minting pauses while it runs.
    ChainSync {
        /// `true` when catch-up starts, `false` when it completes.
        started: bool,
    },

    // =========================================================================
    // SUBSYSTEM 5: CHUNK SYNC
    // =========================================================================
    /// A peer was dropped by the streamer registry.
    PeerDropped {
        /// The dropped peer.
        peer: PeerId,
        /// Why the peer was dropped.
        reason: String,
    },

    // =========================================================================
    // CRITICAL ERRORS (Dead Letter Queue)
    // =========================================================================
    /// A fatal invariant violation; the node should abort.
    CriticalError {
        /// Subsystem that raised the error.
        subsystem_id: u8,
        /// Error description.
        error: String,
    },
}

impl BlockchainEvent {
    /// Get the topic for this event.
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::NewHead { .. } => EventTopic::Chain,
            Self::LeaderChanged { .. } => EventTopic::Consensus,
            Self::ChainSync { .. } => EventTopic::Sync,
            Self::PeerDropped { .. } => EventTopic::Network,
            Self::CriticalError { .. } => EventTopic::DeadLetterQueue,
        }
    }

    /// Get the source subsystem ID for this event.
    #[must_use]
    pub fn source_subsystem(&self) -> u8 {
        match self {
            Self::NewHead { .. } | Self::LeaderChanged { .. } | Self::ChainSync { .. } => 17,
            Self::PeerDropped { .. } => 5,
            Self::CriticalError { subsystem_id, .. } => *subsystem_id,
        }
    }
}

/// Event topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Canonical chain progress.
    Chain,
    /// Raft leadership.
    Consensus,
    /// Chain catch-up.
    Sync,
    /// Overlay peer lifecycle.
    Network,
    /// Dead Letter Queue for critical errors.
    DeadLetterQueue,
    /// All events (no filtering).
    All,
}

/// Filter for subscribing to specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<EventTopic>,
    /// Source subsystems to include. Empty means all sources.
    pub source_subsystems: Vec<u8>,
}

impl EventFilter {
    /// Create a filter that accepts all events.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self {
            topics,
            source_subsystems: Vec::new(),
        }
    }

    /// Create a filter for events from specific subsystems.
    #[must_use]
    pub fn from_subsystems(subsystems: Vec<u8>) -> Self {
        Self {
            topics: Vec::new(),
            source_subsystems: subsystems,
        }
    }

    /// Check if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &BlockchainEvent) -> bool {
        let topic_match = self.topics.is_empty()
            || self.topics.contains(&EventTopic::All)
            || self.topics.contains(&event.topic());

        let source_match = self.source_subsystems.is_empty()
            || self.source_subsystems.contains(&event.source_subsystem());

        topic_match && source_match
    }
}
