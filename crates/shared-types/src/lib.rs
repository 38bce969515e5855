//! # Shared Types Crate
//!
//! Identifiers, entities, the key-value storage port and the keyed cache
//! shared by the raft minter (qc-17), the chunk-sync streamer (qc-05) and
//! the node runtime.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: cross-crate types are defined here.
//! - **Ports, not engines**: persistence is reached only through
//!   [`KeyValueStore`]; backends live with the runtime.

pub mod cache;
pub mod entities;
pub mod errors;
pub mod kv;

pub use cache::{CacheCapability, KeyedCache};
pub use entities::*;
pub use errors::*;
pub use kv::{BatchOperation, InMemoryKVStore, KeyValueStore};
