//! # Error Types
//!
//! Defines error types used across crates.

use thiserror::Error;

/// Errors raised by a [`KeyValueStore`](crate::kv::KeyValueStore) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// I/O error during read/write.
    #[error("KV store I/O error: {message}")]
    Io { message: String },

    /// Stored bytes could not be decoded.
    #[error("KV store corruption: {message}")]
    Corruption { message: String },

    /// The store has been closed.
    #[error("KV store closed")]
    Closed,
}

impl StoreError {
    pub fn io(message: impl Into<String>) -> Self {
        StoreError::Io {
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        StoreError::Corruption {
            message: message.into(),
        }
    }
}
