//! Error types for the chunk-sync subsystem

use shared_types::{PeerId, StoreError};
use thiserror::Error;

/// Result type alias for streamer operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Streamer errors.
///
/// `Clone` because coalesced fetches hand the same outcome to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The transport to the peer is gone
    #[error("Peer dropped: {peer}")]
    PeerDropped { peer: PeerId },

    /// Delivered payload does not hash to its key
    #[error("Chunk mismatch for key {key}")]
    ChunkMismatch { key: String },

    /// No factory is registered for the stream kind
    #[error("Unknown stream kind: {kind}")]
    UnknownStream { kind: String },

    /// A server was asked for indices on the wrong side of its session boundary
    #[error("Stream {stream} out of session: from {from}, session {session}")]
    OutOfSession {
        stream: String,
        from: u64,
        session: u64,
    },

    /// A client for the (peer, stream) pair already exists
    #[error("Subscription exists: {stream}")]
    SubscriptionExists { stream: String },

    /// The operation was cancelled by a peer drop or shutdown
    #[error("Operation canceled")]
    Canceled,

    /// A batch or fetch did not complete in time
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The peer is not connected
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The peer serves too many of our streams already
    #[error("Too many servers for peer (limit {limit})")]
    TooManyServers { limit: usize },

    /// Neither the local store nor any peer had the chunk
    #[error("Chunk not found: {key}")]
    ChunkNotFound { key: String },

    /// The remote server refused a subscription
    #[error("Subscription to {stream} rejected: {reason}")]
    Rejected { stream: String, reason: String },

    /// Stream descriptor or parameter could not be parsed
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Storage corruption is the only condition that should stop the streamer
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::Corruption { .. }))
    }

    /// Conditions that clear up on their own or after a reconnect
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::PeerDropped { .. }
                | SyncError::ChunkMismatch { .. }
                | SyncError::Canceled
                | SyncError::Timeout { .. }
                | SyncError::ChunkNotFound { .. }
                | SyncError::Store(StoreError::Io { .. })
        )
    }

    pub(crate) fn mismatch(key: &[u8]) -> Self {
        SyncError::ChunkMismatch {
            key: hex::encode(key),
        }
    }

    pub(crate) fn not_found(key: &[u8]) -> Self {
        SyncError::ChunkNotFound {
            key: hex::encode(key),
        }
    }
}

impl From<bincode::Error> for SyncError {
    fn from(err: bincode::Error) -> Self {
        SyncError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Canceled.is_recoverable());
        assert!(!SyncError::Canceled.is_fatal());
        assert!(SyncError::Store(StoreError::corruption("bad")).is_fatal());
        assert!(!SyncError::UnknownStream { kind: "X".into() }.is_recoverable());
    }

    #[test]
    fn test_mismatch_renders_hex_key() {
        let err = SyncError::mismatch(&[0xab, 0xcd]);
        assert_eq!(err.to_string(), "Chunk mismatch for key abcd");
    }
}
