//! # Keyed LRU Cache
//!
//! A bounded keyed cache with least-recently-used eviction, exposed through
//! the small [`CacheCapability`] interface so process-wide instances can be
//! swapped for an empty one in tests.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Lookup capability over a keyed cache.
pub trait CacheCapability<K, V>: Send + Sync {
    /// Insert or refresh `key`, returning the previous value.
    fn insert(&self, key: K, value: V) -> Option<V>;

    /// Fetch a clone of the value and mark it recently used.
    fn get(&self, key: &K) -> Option<V>;

    /// Membership test that does not touch recency.
    fn contains(&self, key: &K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries held.
    fn limit(&self) -> usize;

    /// Drop every entry.
    fn clear(&self);
}

/// Thread-safe LRU cache of at most `limit` entries.
pub struct KeyedCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
    limit: NonZeroUsize,
}

impl<K: Hash + Eq, V> KeyedCache<K, V> {
    /// Create a cache holding at most `limit` entries (a zero limit holds one).
    pub fn new(limit: usize) -> Self {
        let limit = NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(limit)),
            limit,
        }
    }
}

impl<K, V> CacheCapability<K, V> for KeyedCache<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + Send,
{
    fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().put(key, value)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn limit(&self) -> usize {
        self.limit.get()
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}
