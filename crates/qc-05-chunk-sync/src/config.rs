//! Registry options

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Whether this node requests and serves single-chunk retrievals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retrieval {
    /// Neither request nor serve
    Disabled,
    /// Request from peers, never serve
    ClientOnly,
    /// Request and serve, forwarding misses
    #[default]
    Enabled,
}

impl Retrieval {
    pub fn can_request(self) -> bool {
        self != Retrieval::Disabled
    }

    pub fn can_serve(self) -> bool {
        self == Retrieval::Enabled
    }
}

/// How the built-in `SYNC` stream is used
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Syncing {
    /// `SYNC` is not registered
    Disabled,
    /// `SYNC` handlers are registered; subscriptions are explicit
    RegisterOnly,
    /// Every new peer is subscribed to on its proximity bin
    #[default]
    AutoSubscribe,
}

impl Syncing {
    pub fn registers(self) -> bool {
        self != Syncing::Disabled
    }
}

/// Registry configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    pub retrieval: Retrieval,

    pub syncing: Syncing,

    /// Accept deliveries without checking `hash(payload) == key`
    pub skip_check: bool,

    /// Keys per offered batch
    pub batch_size: u64,

    /// Bound on waiting for the wanted chunks of one batch
    pub batch_timeout_ms: u64,

    /// Delay before a live server polls an exhausted index again
    pub live_poll_interval_ms: u64,

    /// Streams a single peer may have us serve
    pub max_peer_servers: usize,

    /// Peers whose reputation falls to this value are dropped
    pub reputation_floor: i32,

    /// Bound on a single-chunk retrieval
    pub retrieve_timeout_ms: u64,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            retrieval: Retrieval::default(),
            syncing: Syncing::default(),
            skip_check: false,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            batch_timeout_ms: 10_000,
            live_poll_interval_ms: 100,
            max_peer_servers: 10_000,
            reputation_floor: -3,
            retrieve_timeout_ms: 5_000,
        }
    }
}

impl RegistryOptions {
    /// Reject values the stream drivers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.batch_timeout_ms == 0 || self.retrieve_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("timeouts must be > 0".into()));
        }
        if self.live_poll_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "live_poll_interval_ms must be > 0".into(),
            ));
        }
        if self.reputation_floor >= 0 {
            return Err(SyncError::InvalidConfig(
                "reputation_floor must be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_millis(self.live_poll_interval_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }
}
