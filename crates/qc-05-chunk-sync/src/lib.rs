//! # Quantum Chain - Chunk Sync (Subsystem 5)
//!
//! **Bounded Context:** Content-addressed chunk replication between peers
//!
//! ## Purpose
//!
//! Peers expose ordered, index-addressed streams of chunk keys. A client
//! subscribes to a stream of a peer, is offered batches of keys, asks for
//! the ones it lacks and records every finished batch, so a reconnect
//! resumes where the last session stopped. Single chunks missing locally
//! can be retrieved from the closest connected peer on demand.
//!
//! ## Architecture
//!
//! ```text
//!            Registry ──subscribe──► ClientTask ──need_data──► Client
//!               │  ▲                     │ WantedHashes     (fetch_func)
//!   reader task │  │ OfferedHashes       ▼
//!               ▼  │                  Peer ──priority queues──► transport
//!          ServerTask ──set_next_batch──► Server
//!               │
//!               └─get_data──► ChunkDelivery
//! ```
//!
//! Each peer has one reader task (in the registry) and one writer task (in
//! [`peer::Peer`]). Outgoing frames are queued per priority so a reader can
//! always make progress. History batches run below the session index taken
//! at subscription time; live batches run from it onward.
//!
//! ## Module Structure
//!
//! - [`domain`]: streams, interval sets, protocol messages, proximity
//! - [`wire`]: frame codec
//! - [`ports`]: server, client, chunk store and transport interfaces
//! - [`registry`]: peers, subscriptions and message dispatch
//! - [`delivery`]: single-chunk retrieval with coalescing
//! - [`sync`]: the built-in `SYNC` stream over proximity bins
//! - [`adapters`]: key-value backed stores and an in-process transport

#![warn(clippy::all)]

pub mod adapters;
pub mod delivery;
pub mod domain;
pub mod peer;
pub mod ports;
pub mod registry;
pub mod sync;
pub mod wire;

mod client;
mod config;
mod error;
mod metrics;
mod server;

pub use config::{RegistryOptions, Retrieval, Syncing};
pub use error::{Result, SyncError};
pub use metrics::Metrics;

pub use adapters::{duplex, IntervalStore, KvChunkStore};
pub use domain::kademlia::{closest_peer, proximity_bin, MAX_PO};
pub use domain::{
    HandoverProof, Intervals, Message, OfferedHashes, Priority, Range, Side, Stream,
    TakeoverProof, WantedHashes,
};
pub use peer::{ClientHandle, ClientStatus};
pub use ports::{ChunkStore, Client, ClientFactory, Connection, FetchFuture, Server, ServerFactory};
pub use registry::Registry;
pub use sync::{sync_stream, SyncClient, SyncServer, SYNC_KIND};

/// Subsystem identifier on the event bus
pub const SUBSYSTEM_ID: u8 = 5;

/// Default number of keys per offered batch
pub const DEFAULT_BATCH_SIZE: u64 = 128;
