//! # Core Domain Entities
//!
//! Identifiers and entities shared by the ordered minter and the chunk-sync
//! streamer.
//!
//! ## Clusters
//!
//! - **Chain**: `SignedTransaction`, `ChainHead`
//! - **Overlay**: `NodeId`, `ChunkAddress`, proximity helpers

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha2::{Digest, Sha256};
use std::fmt;

// Re-export U256 from primitive-types for use across all crates
pub use primitive_types::U256;

/// Width in bytes of every hash and chunk address.
pub const HASH_SIZE: usize = 32;

// =============================================================================
// CLUSTER A: THE CHAIN
// =============================================================================

/// A 32-byte hash.
pub type Hash = [u8; HASH_SIZE];

/// A 64-byte transaction signature.
pub type Signature = [u8; 64];

/// A 20-byte account address.
pub type Address = [u8; 20];

/// A signed transaction as held by the pool and executed by the minter.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Sender address.
    pub from: Address,
    /// Recipient address (optional for contract creation).
    pub to: Option<Address>,
    /// Transaction value in base units.
    pub value: U256,
    /// Sender's nonce to prevent replay.
    pub nonce: u64,
    /// Gas price in base units.
    pub gas_price: U256,
    /// Gas limit for this transaction.
    pub gas_limit: u64,
    /// Call data.
    pub data: Vec<u8>,
    /// Signature over the transaction (opaque to this crate).
    #[serde_as(as = "Bytes")]
    pub signature: Signature,
}

impl SignedTransaction {
    /// Compute the transaction hash.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.from);
        if let Some(to) = &self.to {
            hasher.update(to);
        }
        let mut value_bytes = [0u8; 32];
        self.value.to_big_endian(&mut value_bytes);
        hasher.update(value_bytes);
        hasher.update(self.nonce.to_le_bytes());
        let mut gas_price_bytes = [0u8; 32];
        self.gas_price.to_big_endian(&mut gas_price_bytes);
        hasher.update(gas_price_bytes);
        hasher.update(self.gas_limit.to_le_bytes());
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    /// Returns the sender address.
    pub fn sender(&self) -> Address {
        self.from
    }

    /// Returns the total cost (value + gas_price * gas_limit).
    pub fn total_cost(&self) -> U256 {
        self.value + self.gas_price * U256::from(self.gas_limit)
    }
}

/// The last applied canonical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ChainHead {
    /// Hash of the head block.
    pub block_hash: Hash,
    /// Height of the head block.
    pub height: u64,
}

impl ChainHead {
    pub fn new(block_hash: Hash, height: u64) -> Self {
        Self { block_hash, height }
    }
}

impl fmt::Display for ChainHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.height, short_hex(&self.block_hash))
    }
}

// =============================================================================
// CLUSTER B: OVERLAY
// =============================================================================

/// Content address of a chunk: the hash of its payload.
pub type ChunkAddress = Hash;

/// Unique identifier for a node in the overlay.
///
/// Node ids share the chunk address space, so XOR distance between a node
/// and a chunk is meaningful.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(pub [u8; HASH_SIZE]);

/// A peer identifier (alias for `NodeId` in peer contexts).
pub type PeerId = NodeId;

impl NodeId {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering used in persisted keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", short_hex(&self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_hex(&self.0))
    }
}

/// Hash a chunk payload into its content address.
pub fn chunk_address(payload: &[u8]) -> ChunkAddress {
    Sha256::digest(payload).into()
}

/// Proximity order: the number of leading bits two addresses share.
///
/// Identical addresses have proximity `8 * HASH_SIZE`.
pub fn proximity(a: &[u8; HASH_SIZE], b: &[u8; HASH_SIZE]) -> usize {
    for i in 0..HASH_SIZE {
        let xor = a[i] ^ b[i];
        if xor != 0 {
            return i * 8 + xor.leading_zeros() as usize;
        }
    }
    HASH_SIZE * 8
}

/// Orders `x` and `y` by XOR distance to `target`; `Less` means `x` is closer.
pub fn distance_cmp(
    target: &[u8; HASH_SIZE],
    x: &[u8; HASH_SIZE],
    y: &[u8; HASH_SIZE],
) -> std::cmp::Ordering {
    for i in 0..HASH_SIZE {
        let dx = target[i] ^ x[i];
        let dy = target[i] ^ y[i];
        if dx != dy {
            return dx.cmp(&dy);
        }
    }
    std::cmp::Ordering::Equal
}

fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(nonce: u64) -> SignedTransaction {
        SignedTransaction {
            from: [0xAA; 20],
            to: Some([0xBB; 20]),
            value: U256::from(100u64),
            nonce,
            gas_price: U256::from(1u64),
            gas_limit: 21_000,
            data: vec![],
            signature: [0u8; 64],
        }
    }

    #[test]
    fn test_tx_hash_depends_on_nonce() {
        assert_ne!(sample_tx(0).hash(), sample_tx(1).hash());
        assert_eq!(sample_tx(7).hash(), sample_tx(7).hash());
    }

    #[test]
    fn test_total_cost() {
        assert_eq!(sample_tx(0).total_cost(), U256::from(21_100u64));
    }

    #[test]
    fn test_proximity() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(proximity(&a, &b), 256);
        b[0] = 0b1000_0000;
        assert_eq!(proximity(&a, &b), 0);
        b[0] = 0b0000_0001;
        assert_eq!(proximity(&a, &b), 7);
        b[0] = 0;
        b[1] = 0b0100_0000;
        assert_eq!(proximity(&a, &b), 9);
    }

    #[test]
    fn test_distance_cmp() {
        let target = [0u8; 32];
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 1;
        assert_eq!(
            distance_cmp(&target, &near, &far),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            distance_cmp(&target, &far, &far),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_chunk_address_is_content_hash() {
        assert_eq!(chunk_address(b"abc"), chunk_address(b"abc"));
        assert_ne!(chunk_address(b"abc"), chunk_address(b"abd"));
    }

    #[test]
    fn test_node_id_serde() {
        let id = NodeId([7u8; 32]);
        let bytes = bincode::serialize(&id).unwrap();
        let back: NodeId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, back);
        assert_eq!(id.to_hex().len(), 64);
    }
}
