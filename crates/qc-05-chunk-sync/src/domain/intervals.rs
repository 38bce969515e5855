//! Coalesced interval sets
//!
//! Records which stream indices a client has consumed. Ranges are closed,
//! sorted, disjoint and never adjacent: `[1,3]` and `[4,6]` are stored as
//! `[1,6]`. Every lookup is a binary search.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Set of consumed indices at or above `start`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervals {
    start: u64,
    ranges: Vec<[u64; 2]>,
}

impl Intervals {
    /// Empty set whose lowest meaningful index is `start`
    pub fn new(start: u64) -> Self {
        Self {
            start,
            ranges: Vec::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn ranges(&self) -> &[[u64; 2]] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record `[from..=to]`. Indices below `start` are ignored.
    pub fn add(&mut self, from: u64, to: u64) {
        let from = from.max(self.start);
        if from > to {
            return;
        }
        // [lo, hi) are the ranges that overlap or touch [from, to]
        let lo = self
            .ranges
            .partition_point(|r| r[1].saturating_add(1) < from);
        let hi = self.ranges.partition_point(|r| r[0] <= to.saturating_add(1));
        if lo == hi {
            self.ranges.insert(lo, [from, to]);
            return;
        }
        let merged = [from.min(self.ranges[lo][0]), to.max(self.ranges[hi - 1][1])];
        self.ranges.splice(lo..hi, [merged]);
    }

    /// Union with another set
    pub fn merge(&mut self, other: &Intervals) {
        for r in &other.ranges {
            self.add(r[0], r[1]);
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        let i = self.ranges.partition_point(|r| r[1] < index);
        self.ranges.get(i).is_some_and(|r| r[0] <= index)
    }

    /// First gap at or above `start`: `(from, Some(to))` for a bounded gap,
    /// `(from, None)` when everything from `from` on is missing.
    pub fn next(&self) -> (u64, Option<u64>) {
        self.next_from(self.start)
    }

    /// First gap at or above `index`
    pub fn next_from(&self, index: u64) -> (u64, Option<u64>) {
        let index = index.max(self.start);
        let i = self.ranges.partition_point(|r| r[1] < index);
        let from = match self.ranges.get(i) {
            Some(r) if r[0] <= index => match r[1].checked_add(1) {
                Some(after) => after,
                // The set covers every index up to u64::MAX
                None => return (u64::MAX, Some(u64::MAX)),
            },
            _ => index,
        };
        let following = self.ranges.partition_point(|r| r[0] <= from);
        let to = self.ranges.get(following).map(|r| r[0] - 1);
        (from, to)
    }

    /// Highest recorded index
    pub fn last(&self) -> Option<u64> {
        self.ranges.last().map(|r| r[1])
    }
}

impl fmt::Display for Intervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "[{},{}]", r[0], r[1])?;
        }
        f.write_str("]")
    }
}
