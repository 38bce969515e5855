//! # Shared Bus - Typed Event Bus
//!
//! Decouples the components of a node: the block applier publishes `NewHead`,
//! the raft protocol manager publishes `LeaderChanged`, the streamer registry
//! publishes `PeerDropped`, and whoever runs chain catch-up publishes
//! `ChainSync`. Each of them is the only writer of its events.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │   Applier    │                    │    Minter    │
//! │              │    publish()       │              │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │  Event Bus   │          │
//!                  │              │ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```
//!
//! Subscribers receive a lazy sequence; a subscriber that falls behind the
//! channel capacity skips the oldest events rather than blocking publishers.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{BlockchainEvent, EventFilter, EventTopic};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{EventStream, EventSubscriber, Subscription, SubscriptionError};

/// Maximum events to buffer per subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
