//! Outbound ports (SPI) for the chunk-sync subsystem.
//!
//! Stream handlers are bound per kind through factories; the chunk store
//! and the peer transport are supplied by the runtime.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use shared_types::{ChunkAddress, Hash, NodeId, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::domain::{OfferedHashes, Stream, TakeoverProof};
use crate::error::Result;

/// Future resolving once a chunk is in the local store
pub type FetchFuture = BoxFuture<'static, Result<()>>;

/// Supplies batches of keys, and the data behind them, for one stream to
/// one peer.
#[async_trait]
pub trait Server: Send + Sync {
    /// Index dividing history from live, read once per subscription
    fn session_index(&self) -> Result<u64>;

    /// Keys for as much of `[from..=to]` as is available, starting at `from`.
    /// An empty batch means nothing is available yet.
    async fn set_next_batch(&self, from: u64, to: u64) -> Result<OfferedHashes>;

    /// Payload behind `key`
    async fn get_data(&self, key: &ChunkAddress) -> Result<Bytes>;

    fn close(&self) {}
}

/// Consumes batches of one stream from one peer.
pub trait Client: Send + Sync {
    /// `None` when the key is already local; otherwise a future that
    /// resolves once the chunk has arrived.
    fn need_data(&self, key: &ChunkAddress) -> Option<FetchFuture>;

    /// Called after every wanted chunk of `[from..=to]` has arrived. A
    /// returned future yields a takeover proof to send back.
    fn batch_done(
        &self,
        stream: &Stream,
        from: u64,
        to: u64,
        root: Hash,
    ) -> Option<BoxFuture<'static, Result<TakeoverProof>>> {
        let _ = (stream, from, to, root);
        None
    }

    fn close(&self) {}
}

/// Builds a server for `(peer, param, live)`
pub type ServerFactory =
    Arc<dyn Fn(&PeerId, &str, bool) -> Result<Arc<dyn Server>> + Send + Sync>;

/// Builds a client for `(peer, param, live)`
pub type ClientFactory =
    Arc<dyn Fn(&PeerId, &str, bool) -> Result<Arc<dyn Client>> + Send + Sync>;

/// Local content-addressed chunk storage with a per-bin arrival index.
///
/// Each bin numbers its chunks densely from 0 in arrival order.
pub trait ChunkStore: Send + Sync {
    /// Overlay address the bins are measured against
    fn base(&self) -> NodeId;

    fn has(&self, key: &ChunkAddress) -> Result<bool>;

    fn get(&self, key: &ChunkAddress) -> Result<Option<Bytes>>;

    /// Store a chunk; `false` if it was already present
    fn put(&self, key: ChunkAddress, data: Bytes) -> Result<bool>;

    /// `None` if present, otherwise a future woken by the matching `put`
    fn fetch_func(&self, key: &ChunkAddress) -> Option<FetchFuture>;

    /// Next index to be assigned in `bin`
    fn bin_index(&self, bin: u8) -> u64;

    /// `(index, key)` pairs of `bin` within `[from..=to]`, ascending
    fn keys_in_bin(&self, bin: u8, from: u64, to: u64) -> Result<Vec<(u64, ChunkAddress)>>;
}

/// One end of a framed, ordered, reliable link to a peer
pub struct Connection {
    pub sender: mpsc::Sender<Bytes>,
    pub receiver: mpsc::Receiver<Bytes>,
}
