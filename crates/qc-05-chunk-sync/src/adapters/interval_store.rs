//! Persistent interval sets per (peer, stream)
//!
//! One record per `intervals:<peer hex>:<kind>:<param>:<live>`; the value is
//! the bincode-encoded [`Intervals`]. Writers to the same key are serialized
//! by a per-key lock, readers are not. A lock lives only while someone
//! holds or waits on it.

use dashmap::DashMap;
use parking_lot::Mutex;
use shared_types::{KeyValueStore, PeerId};
use std::sync::Arc;
use tracing::trace;

use crate::domain::{Intervals, Stream};
use crate::error::Result;

pub struct IntervalStore {
    kv: Arc<dyn KeyValueStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IntervalStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            locks: DashMap::new(),
        }
    }

    pub fn key(peer: &PeerId, stream: &Stream) -> String {
        format!(
            "intervals:{}:{}:{}:{}",
            peer.to_hex(),
            stream.kind,
            stream.param,
            stream.live
        )
    }

    pub fn get(&self, peer: &PeerId, stream: &Stream) -> Result<Option<Intervals>> {
        self.load(&Self::key(peer, stream))
    }

    pub fn put(&self, peer: &PeerId, stream: &Stream, intervals: &Intervals) -> Result<()> {
        let key = Self::key(peer, stream);
        self.locked(&key, || {
            self.kv.put(key.as_bytes(), &bincode::serialize(intervals)?)?;
            Ok(())
        })
    }

    pub fn delete(&self, peer: &PeerId, stream: &Stream) -> Result<()> {
        let key = Self::key(peer, stream);
        self.locked(&key, || {
            self.kv.delete(key.as_bytes())?;
            Ok(())
        })
    }

    /// Existing record, or a fresh empty one starting at `start`
    pub fn init(&self, peer: &PeerId, stream: &Stream, start: u64) -> Result<Intervals> {
        let key = Self::key(peer, stream);
        self.locked(&key, || {
            if let Some(existing) = self.load(&key)? {
                return Ok(existing);
            }
            let fresh = Intervals::new(start);
            self.kv.put(key.as_bytes(), &bincode::serialize(&fresh)?)?;
            Ok(fresh)
        })
    }

    /// Merge `[from..=to]` into the record and return the result
    pub fn add(&self, peer: &PeerId, stream: &Stream, from: u64, to: u64) -> Result<Intervals> {
        let key = Self::key(peer, stream);
        self.locked(&key, || {
            let mut intervals = self.load(&key)?.unwrap_or_default();
            intervals.add(from, to);
            self.kv.put(key.as_bytes(), &bincode::serialize(&intervals)?)?;
            trace!(%peer, %stream, from, to, %intervals, "[qc-05] interval recorded");
            Ok(intervals)
        })
    }

    /// First gap of the record; `(0, None)` when nothing is recorded
    pub fn next(&self, peer: &PeerId, stream: &Stream) -> Result<(u64, Option<u64>)> {
        Ok(self
            .get(peer, stream)?
            .map(|intervals| intervals.next())
            .unwrap_or((0, None)))
    }

    fn load(&self, key: &str) -> Result<Option<Intervals>> {
        match self.kv.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Run `op` under the lock for `key`, dropping the lock entry after the
    /// last holder is done
    fn locked<T>(&self, key: &str, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let result = {
            let _guard = lock.lock();
            op()
        };
        drop(lock);
        // New holders clone under the shard lock, so a count of one is final
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Keys with a live lock
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
