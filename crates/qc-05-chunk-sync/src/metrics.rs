//! Metrics collection for the chunk-sync subsystem

use std::sync::atomic::{AtomicU64, Ordering};

/// Streamer counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Non-empty batches offered by local servers
    pub batches_offered: AtomicU64,

    /// Batches recorded by local clients
    pub batches_done: AtomicU64,

    /// Batches abandoned on timeout or error
    pub batches_failed: AtomicU64,

    /// Chunks accepted from peers
    pub chunks_received: AtomicU64,

    /// Chunks sent to peers
    pub chunks_sent: AtomicU64,

    /// Deliveries rejected for a hash mismatch
    pub chunk_mismatches: AtomicU64,

    /// Retrievals that joined an in-flight fetch
    pub fetches_coalesced: AtomicU64,

    /// Peers dropped
    pub peers_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch_offered(&self) {
        self.batches_offered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_done(&self) {
        self.batches_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_mismatch(&self) {
        self.chunk_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_coalesced(&self) {
        self.fetches_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_dropped(&self) {
        self.peers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of a counter
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
