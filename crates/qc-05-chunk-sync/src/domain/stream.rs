//! Stream descriptors, ranges and priorities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// A named conduit between a local client and a remote server.
///
/// Rendered as `kind|param|l` for live streams and `kind|param|h` for
/// history streams.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stream {
    pub kind: String,
    pub param: String,
    pub live: bool,
}

impl Stream {
    pub fn new(kind: impl Into<String>, param: impl Into<String>, live: bool) -> Self {
        Self {
            kind: kind.into(),
            param: param.into(),
            live,
        }
    }

    /// The history counterpart of this stream
    pub fn history(&self) -> Self {
        Self {
            live: false,
            ..self.clone()
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = if self.live { "l" } else { "h" };
        write!(f, "{}|{}|{}", self.kind, self.param, t)
    }
}

impl FromStr for Stream {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidStream(s.to_string());
        let (rest, t) = s.rsplit_once('|').ok_or_else(invalid)?;
        let (kind, param) = rest.split_once('|').ok_or_else(invalid)?;
        let live = match t {
            "l" => true,
            "h" => false,
            _ => return Err(invalid()),
        };
        if kind.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(kind, param, live))
    }
}

/// Requested index range; `to == 0` means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub from: u64,
    pub to: u64,
}

impl Range {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn is_unbounded(&self) -> bool {
        self.to == 0
    }

    /// Upper bound, if any
    pub fn upper(&self) -> Option<u64> {
        (!self.is_unbounded()).then_some(self.to)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper() {
            Some(to) => write!(f, "{}-{}", self.from, to),
            None => write!(f, "{}-", self.from),
        }
    }
}

/// Scheduling class of outgoing frames. Higher drains first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    #[default]
    Mid = 1,
    High = 2,
    Top = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}
