//! Stream exchange messages

use bitvec::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shared_types::{chunk_address, ChunkAddress, Hash, HASH_SIZE};

use super::stream::{Priority, Range, Stream};

/// Server-signed assertion over an offered batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverProof {
    pub root: Hash,
    pub signature: Vec<u8>,
}

/// Client receipt for a completed batch: it will serve `[from..=to]` onward
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverProof {
    pub from: u64,
    pub to: u64,
    pub root: Hash,
    pub receipt: Vec<u8>,
}

/// A contiguous batch of keys `[from..=to]`.
///
/// `hashes` holds `HASH_SIZE` bytes per index in ascending order. An empty
/// batch carries no hashes and only marks the position it was cut at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferedHashes {
    pub from: u64,
    pub to: u64,
    pub hashes: Bytes,
    pub proof: Option<HandoverProof>,
}

impl OfferedHashes {
    pub fn new(from: u64, to: u64, hashes: Bytes) -> Self {
        Self {
            from,
            to,
            hashes,
            proof: None,
        }
    }

    pub fn empty(at: u64) -> Self {
        Self::new(at, at, Bytes::new())
    }

    /// Build a batch from `(index, key)` pairs that must be contiguous
    pub fn from_keys(keys: &[(u64, ChunkAddress)], at: u64) -> Self {
        match (keys.first(), keys.last()) {
            (Some(first), Some(last)) => {
                let mut buf = Vec::with_capacity(keys.len() * HASH_SIZE);
                for (_, key) in keys {
                    buf.extend_from_slice(key);
                }
                Self::new(first.0, last.0, Bytes::from(buf))
            }
            _ => Self::empty(at),
        }
    }

    pub fn with_proof(mut self, proof: HandoverProof) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hashes.len() / HASH_SIZE
    }

    /// Key at position `i` of the batch
    pub fn key_at(&self, i: usize) -> Option<ChunkAddress> {
        let chunk = self.hashes.get(i * HASH_SIZE..(i + 1) * HASH_SIZE)?;
        let mut key = [0u8; HASH_SIZE];
        key.copy_from_slice(chunk);
        Some(key)
    }

    /// `(index, key)` pairs in order
    pub fn keys(&self) -> impl Iterator<Item = (u64, ChunkAddress)> + '_ {
        (0..self.len()).filter_map(move |i| Some((self.from + i as u64, self.key_at(i)?)))
    }

    /// Hash over the concatenated keys
    pub fn root(&self) -> Hash {
        chunk_address(&self.hashes)
    }
}

/// Which keys of batch `[from..=to]` the client still needs; bit `i` is
/// index `from + i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WantedHashes {
    pub from: u64,
    pub to: u64,
    pub want: BitVec<u8, Lsb0>,
}

impl WantedHashes {
    pub fn none(batch: &OfferedHashes) -> Self {
        Self {
            from: batch.from,
            to: batch.to,
            want: bitvec![u8, Lsb0; 0; batch.len()],
        }
    }

    pub fn count(&self) -> usize {
        self.want.count_ones()
    }

    /// Positions within the batch that are wanted
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.want.iter_ones()
    }
}

/// Which side of a stream sent a `Quit`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

/// Every frame exchanged between two registries
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    RequestSubscription {
        stream: Stream,
        range: Option<Range>,
        priority: Priority,
    },
    OfferedHashes {
        stream: Stream,
        batch: OfferedHashes,
    },
    WantedHashes {
        stream: Stream,
        wanted: WantedHashes,
    },
    ChunkDelivery {
        key: ChunkAddress,
        data: Bytes,
    },
    TakeoverProof {
        stream: Stream,
        proof: TakeoverProof,
    },
    Quit {
        stream: Stream,
        side: Side,
    },
    SubscribeError {
        stream: Stream,
        reason: String,
    },
    RetrieveRequest {
        key: ChunkAddress,
        skip_check: bool,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::RequestSubscription { .. } => "RequestSubscription",
            Message::OfferedHashes { .. } => "OfferedHashes",
            Message::WantedHashes { .. } => "WantedHashes",
            Message::ChunkDelivery { .. } => "ChunkDelivery",
            Message::TakeoverProof { .. } => "TakeoverProof",
            Message::Quit { .. } => "Quit",
            Message::SubscribeError { .. } => "SubscribeError",
            Message::RetrieveRequest { .. } => "RetrieveRequest",
        }
    }
}
