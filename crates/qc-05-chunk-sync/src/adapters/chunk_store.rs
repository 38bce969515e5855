//! Key-value backed chunk store
//!
//! Layout:
//! - `c/<key>`: payload
//! - `i/<bin><index-be>`: key of the chunk assigned `index` in `bin`
//! - `n/<bin>`: next index of `bin`
//!
//! A new chunk and its index entries are written in one atomic batch.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use shared_types::{BatchOperation, ChunkAddress, KeyValueStore, NodeId, StoreError, HASH_SIZE};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::warn;

use crate::domain::kademlia::{proximity_bin, MAX_PO};
use crate::error::{Result, SyncError};
use crate::ports::{ChunkStore, FetchFuture};

const BINS: usize = MAX_PO as usize + 1;

type Waiters = DashMap<ChunkAddress, Vec<oneshot::Sender<()>>>;

pub struct KvChunkStore {
    kv: Arc<dyn KeyValueStore>,
    base: NodeId,
    counters: Mutex<[u64; BINS]>,
    waiters: Arc<Waiters>,
}

impl KvChunkStore {
    /// Open over `kv`, recovering the bin counters
    pub fn open(kv: Arc<dyn KeyValueStore>, base: NodeId) -> Result<Self> {
        let mut counters = [0u64; BINS];
        for (key, value) in kv.prefix_scan(b"n/")? {
            let bin = *key.get(2).ok_or_else(|| corrupt("counter key"))? as usize;
            let raw: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("counter value"))?;
            if bin < BINS {
                counters[bin] = u64::from_be_bytes(raw);
            }
        }
        Ok(Self {
            kv,
            base,
            counters: Mutex::new(counters),
            waiters: Arc::new(DashMap::new()),
        })
    }

    /// Number of fetches waiting for a chunk
    pub fn pending_fetches(&self) -> usize {
        self.waiters.iter().map(|entry| entry.value().len()).sum()
    }

    fn chunk_key(key: &ChunkAddress) -> Vec<u8> {
        [&b"c/"[..], &key[..]].concat()
    }

    fn index_key(bin: u8, index: u64) -> Vec<u8> {
        [&b"i/"[..], &[bin][..], &index.to_be_bytes()[..]].concat()
    }

    fn counter_key(bin: u8) -> Vec<u8> {
        [&b"n/"[..], &[bin][..]].concat()
    }
}

/// Resolves once `put` stores the key. Dropping it unfetched releases its
/// sender, and the key's entry once no sender is left.
struct Waiter {
    key: ChunkAddress,
    rx: Option<oneshot::Receiver<()>>,
    waiters: Arc<Waiters>,
}

impl Future for Waiter {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| SyncError::Canceled)),
            None => Poll::Ready(Err(SyncError::Canceled)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.waiters.remove_if_mut(&self.key, |_, senders| {
            senders.retain(|sender| !sender.is_closed());
            senders.is_empty()
        });
    }
}

fn corrupt(what: &str) -> SyncError {
    SyncError::Store(StoreError::corruption(format!("chunk store: bad {what}")))
}

impl ChunkStore for KvChunkStore {
    fn base(&self) -> NodeId {
        self.base
    }

    fn has(&self, key: &ChunkAddress) -> Result<bool> {
        Ok(self.kv.exists(&Self::chunk_key(key))?)
    }

    fn get(&self, key: &ChunkAddress) -> Result<Option<Bytes>> {
        Ok(self.kv.get(&Self::chunk_key(key))?.map(Bytes::from))
    }

    fn put(&self, key: ChunkAddress, data: Bytes) -> Result<bool> {
        {
            let mut counters = self.counters.lock();
            if self.has(&key)? {
                return Ok(false);
            }
            let bin = proximity_bin(&self.base, &key);
            let index = counters[bin as usize];
            self.kv.atomic_batch_write(vec![
                BatchOperation::put(Self::chunk_key(&key), data.to_vec()),
                BatchOperation::put(Self::index_key(bin, index), key.to_vec()),
                BatchOperation::put(Self::counter_key(bin), (index + 1).to_be_bytes().to_vec()),
            ])?;
            counters[bin as usize] = index + 1;
        }
        if let Some((_, waiters)) = self.waiters.remove(&key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        Ok(true)
    }

    fn fetch_func(&self, key: &ChunkAddress) -> Option<FetchFuture> {
        // Holding the entry across the check orders it against `put`'s removal
        let mut entry = self.waiters.entry(*key).or_default();
        entry.retain(|sender| !sender.is_closed());
        let held = self.has(key).unwrap_or_else(|err| {
            warn!(key = %hex::encode(key), %err, "[qc-05] chunk lookup failed, fetching anyway");
            false
        });
        if held {
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.waiters.remove_if(key, |_, waiters| waiters.is_empty());
            }
            return None;
        }
        let (tx, rx) = oneshot::channel();
        entry.push(tx);
        drop(entry);
        Some(Box::pin(Waiter {
            key: *key,
            rx: Some(rx),
            waiters: Arc::clone(&self.waiters),
        }))
    }

    fn bin_index(&self, bin: u8) -> u64 {
        self.counters.lock().get(bin as usize).copied().unwrap_or(0)
    }

    fn keys_in_bin(&self, bin: u8, from: u64, to: u64) -> Result<Vec<(u64, ChunkAddress)>> {
        let next = self.bin_index(bin);
        if from >= next || from > to {
            return Ok(Vec::new());
        }
        let last = to.min(next - 1);
        let mut keys = Vec::with_capacity((last - from + 1) as usize);
        for index in from..=last {
            let raw = self
                .kv
                .get(&Self::index_key(bin, index))?
                .ok_or_else(|| corrupt("bin index gap"))?;
            let key: [u8; HASH_SIZE] = raw
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("index entry"))?;
            keys.push((index, key));
        }
        Ok(keys)
    }
}
