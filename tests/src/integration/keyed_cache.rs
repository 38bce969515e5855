//! # Keyed Cache Cap
//!
//! The cache is used through `CacheCapability` trait objects, the way the
//! block applier holds its recently applied blocks.

use std::sync::Arc;

use shared_types::{CacheCapability, KeyedCache};

const LIMIT: usize = 32;

fn cache(limit: usize) -> Arc<dyn CacheCapability<u64, String>> {
    Arc::new(KeyedCache::new(limit))
}

#[test]
fn test_one_past_the_limit_evicts_the_oldest() {
    let cache = cache(LIMIT);
    for key in 0..=LIMIT as u64 {
        cache.insert(key, format!("block {key}"));
    }

    assert_eq!(cache.len(), LIMIT);
    assert_eq!(cache.limit(), LIMIT);
    assert!(!cache.contains(&0));
    assert_eq!(cache.get(&0), None);
    for key in 1..=LIMIT as u64 {
        assert_eq!(cache.get(&key), Some(format!("block {key}")), "key {key}");
    }
}

#[test]
fn test_everything_before_the_window_is_gone() {
    let cache = cache(LIMIT);
    let total = 3 * LIMIT as u64;
    for key in 0..total {
        cache.insert(key, key.to_string());
    }

    let first_kept = total - LIMIT as u64;
    assert!((0..first_kept).all(|key| !cache.contains(&key)));
    assert!((first_kept..total).all(|key| cache.contains(&key)));
}

#[test]
fn test_substituted_instance_starts_empty() {
    let shared = cache(LIMIT);
    shared.insert(7, "seven".into());

    let substitute = cache(LIMIT);
    assert!(substitute.is_empty());
    assert_eq!(substitute.get(&7), None);

    shared.clear();
    assert!(shared.is_empty());
}
