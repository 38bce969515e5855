//! Raft minter counters
//!
//! One counter per outcome of a proposal or a committed entry. Callers read
//! a consistent-enough copy through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::MinterError;

#[derive(Debug, Default)]
pub struct Metrics {
    proposals_committed: AtomicU64,
    proposal_timeouts: AtomicU64,
    proposals_dropped: AtomicU64,
    txs_proposed: AtomicU64,
    txs_rejected: AtomicU64,
    speculative_resets: AtomicU64,
    blocks_applied: AtomicU64,
    rivals_discarded: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Own blocks the raft log accepted
    pub proposals_committed: u64,
    /// Own blocks not committed within the proposal timeout
    pub proposal_timeouts: u64,
    /// Own blocks the log dropped or refused (term change, lost leadership)
    pub proposals_dropped: u64,
    pub txs_proposed: u64,
    /// Pool transactions that failed speculative execution
    pub txs_rejected: u64,
    /// Speculative chains thrown away by a rival commit or a demotion
    pub speculative_resets: u64,
    pub blocks_applied: u64,
    /// Committed blocks that lost a term-boundary race
    pub rivals_discarded: u64,
}

impl MetricsSnapshot {
    /// Transactions per committed proposal
    pub fn txs_per_proposal(&self) -> f64 {
        if self.proposals_committed == 0 {
            return 0.0;
        }
        self.txs_proposed as f64 / self.proposals_committed as f64
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proposal_committed(&self, tx_count: usize) {
        self.proposals_committed.fetch_add(1, Ordering::Relaxed);
        self.txs_proposed
            .fetch_add(tx_count as u64, Ordering::Relaxed);
    }

    /// Count a failed proposal under its cause
    pub fn proposal_failed(&self, err: &MinterError) {
        let counter = match err {
            MinterError::ProposalTimeout { .. } => &self.proposal_timeouts,
            _ => &self.proposals_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_rejected(&self) {
        self.txs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn speculative_reset(&self) {
        self.speculative_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_applied(&self) {
        self.blocks_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rival_discarded(&self) {
        self.rivals_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            proposals_committed: read(&self.proposals_committed),
            proposal_timeouts: read(&self.proposal_timeouts),
            proposals_dropped: read(&self.proposals_dropped),
            txs_proposed: read(&self.txs_proposed),
            txs_rejected: read(&self.txs_rejected),
            speculative_resets: read(&self.speculative_resets),
            blocks_applied: read(&self.blocks_applied),
            rivals_discarded: read(&self.rivals_discarded),
        }
    }
}
