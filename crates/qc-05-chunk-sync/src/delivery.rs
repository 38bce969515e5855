//! Demand-side chunk retrieval
//!
//! A local miss is asked of the connected peer closest to the key. Every
//! concurrent request for one key shares a single in-flight fetch.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use shared_types::{ChunkAddress, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::kademlia::closest_peer;
use crate::domain::{Message, Priority};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::peer::Peer;
use crate::ports::ChunkStore;

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes>>>;

pub struct Delivery {
    store: Arc<dyn ChunkStore>,
    inflight: DashMap<ChunkAddress, (u64, SharedFetch)>,
    next_id: AtomicU64,
    timeout: Duration,
    skip_check: bool,
    metrics: Arc<Metrics>,
}

impl Delivery {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        timeout: Duration,
        skip_check: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            inflight: DashMap::new(),
            next_id: AtomicU64::new(0),
            timeout,
            skip_check,
            metrics,
        }
    }

    /// Fetch `key` from the closest of `peers` other than `originator`
    pub async fn request_from_peers(
        &self,
        key: ChunkAddress,
        peers: Vec<Arc<Peer>>,
        originator: Option<&PeerId>,
    ) -> Result<Bytes> {
        if let Some(data) = self.store.get(&key)? {
            return Ok(data);
        }
        let (id, fetch) = match self.inflight.entry(key) {
            Entry::Occupied(entry) => {
                self.metrics.record_fetch_coalesced();
                let (id, fetch) = entry.get();
                (*id, fetch.clone())
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let fetch = self.fetch(key, peers, originator).boxed().shared();
                entry.insert((id, fetch.clone()));
                (id, fetch)
            }
        };
        let mut waiting = Waiting {
            inflight: &self.inflight,
            key,
            id,
            fetch,
            done: false,
        };
        let result = (&mut waiting.fetch).await;
        waiting.done = true;
        result
    }

    /// Fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    fn fetch(
        &self,
        key: ChunkAddress,
        peers: Vec<Arc<Peer>>,
        originator: Option<&PeerId>,
    ) -> impl std::future::Future<Output = Result<Bytes>> + Send + 'static {
        let target = closest_peer(&key, peers.iter().map(|peer| peer.id()), originator);
        let peer = target.and_then(|id| peers.into_iter().find(|peer| peer.id() == id));
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        let skip_check = self.skip_check;

        async move {
            let Some(peer) = peer else {
                return Err(SyncError::not_found(&key));
            };
            let Some(wait) = store.fetch_func(&key) else {
                return store.get(&key)?.ok_or_else(|| SyncError::not_found(&key));
            };
            debug!(peer = %peer.id(), key = %hex::encode(key), "[qc-05] retrieve request");
            peer.send(&Message::RetrieveRequest { key, skip_check }, Priority::Top)?;

            let cancel = peer.cancel_token().clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Canceled),
                arrived = tokio::time::timeout(timeout, wait) => {
                    arrived.map_err(|_| SyncError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })??;
                }
            }
            store.get(&key)?.ok_or_else(|| SyncError::not_found(&key))
        }
    }
}

/// One caller's share of an in-flight fetch. The entry goes once the fetch
/// completes, or once the last caller gives up on it.
struct Waiting<'a> {
    inflight: &'a DashMap<ChunkAddress, (u64, SharedFetch)>,
    key: ChunkAddress,
    id: u64,
    fetch: SharedFetch,
    done: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let (id, done) = (self.id, self.done);
        // Joining callers clone under the shard lock, so the count is stable here
        self.inflight.remove_if(&self.key, |_, (current, fetch)| {
            *current == id && (done || fetch.strong_count().map_or(true, |owners| owners <= 2))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::KvChunkStore;
    use crate::wire;
    use shared_types::{chunk_address, InMemoryKVStore, NodeId};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn delivery(store: Arc<KvChunkStore>) -> Delivery {
        Delivery::new(store, Duration::from_secs(2), false, Arc::new(Metrics::new()))
    }

    fn node(first_byte: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = first_byte;
        NodeId::new(bytes)
    }

    #[tokio::test]
    async fn test_local_hit_needs_no_peer() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let data = Bytes::from_static(b"local");
        let key = chunk_address(&data);
        store.put(key, data.clone()).unwrap();
        let got = delivery(store).request_from_peers(key, Vec::new(), None).await;
        assert_eq!(got.unwrap(), data);
    }

    #[tokio::test]
    async fn test_no_peer_is_not_found() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let result = delivery(store)
            .request_from_peers([9u8; 32], Vec::new(), None)
            .await;
        assert!(matches!(result, Err(SyncError::ChunkNotFound { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let delivery = Arc::new(delivery(Arc::clone(&store)));
        let data = Bytes::from_static(b"remote chunk");
        let key = chunk_address(&data);

        let (near_sink, mut near_wire) = mpsc::channel(8);
        let (far_sink, mut far_wire) = mpsc::channel(8);
        let mut near_id = [0u8; 32];
        near_id.copy_from_slice(&key);
        let near = Peer::start(NodeId::new(near_id), near_sink, CancellationToken::new());
        let mut far_id = key;
        far_id[0] ^= 0x80;
        let far = Peer::start(NodeId::new(far_id), far_sink, CancellationToken::new());
        let peers = vec![Arc::clone(&far), Arc::clone(&near)];

        let first = {
            let delivery = Arc::clone(&delivery);
            let peers = peers.clone();
            tokio::spawn(async move { delivery.request_from_peers(key, peers, None).await })
        };
        let second = {
            let delivery = Arc::clone(&delivery);
            tokio::spawn(async move { delivery.request_from_peers(key, peers, None).await })
        };

        // Exactly one request reaches the closest peer
        let frame = near_wire.recv().await.unwrap();
        assert_eq!(
            wire::decode(frame).unwrap(),
            Message::RetrieveRequest {
                key,
                skip_check: false
            }
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(near_wire.try_recv().is_err());
        assert!(far_wire.try_recv().is_err());
        assert_eq!(delivery.in_flight(), 1);

        store.put(key, data.clone()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), data);
        assert_eq!(second.await.unwrap().unwrap(), data);
        assert_eq!(delivery.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_leaves_nothing_in_flight() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let delivery = Arc::new(delivery(Arc::clone(&store)));
        let (sink, mut wire_rx) = mpsc::channel(8);
        let peer = Peer::start(node(1), sink, CancellationToken::new());
        let key = [6u8; 32];

        let spawn_request = || {
            let delivery = Arc::clone(&delivery);
            let peers = vec![Arc::clone(&peer)];
            tokio::spawn(async move { delivery.request_from_peers(key, peers, None).await })
        };
        let first = spawn_request();
        wire_rx.recv().await.unwrap();
        let second = spawn_request();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(delivery.in_flight(), 1);

        // One caller leaving keeps the fetch for the other
        first.abort();
        let _ = first.await;
        assert_eq!(delivery.in_flight(), 1);

        second.abort();
        let _ = second.await;
        assert_eq!(delivery.in_flight(), 0);
        assert_eq!(store.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn test_peer_drop_cancels_fetch() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let delivery = Arc::new(delivery(store));
        let (sink, mut wire_rx) = mpsc::channel(8);
        let peer = Peer::start(node(1), sink, CancellationToken::new());

        let request = {
            let delivery = Arc::clone(&delivery);
            let peers = vec![Arc::clone(&peer)];
            tokio::spawn(async move { delivery.request_from_peers([5u8; 32], peers, None).await })
        };
        wire_rx.recv().await.unwrap();
        peer.cancel_token().cancel();
        assert_eq!(request.await.unwrap(), Err(SyncError::Canceled));
    }

    #[tokio::test]
    async fn test_originator_is_never_asked() {
        let store = Arc::new(
            KvChunkStore::open(Arc::new(InMemoryKVStore::new()), node(0)).unwrap(),
        );
        let (sink, _wire_rx) = mpsc::channel(8);
        let only = Peer::start(node(1), sink, CancellationToken::new());
        let result = delivery(store)
            .request_from_peers([5u8; 32], vec![Arc::clone(&only)], Some(&only.id()))
            .await;
        assert!(matches!(result, Err(SyncError::ChunkNotFound { .. })));
    }
}
