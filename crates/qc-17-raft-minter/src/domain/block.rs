//! Block entity minted by the leader and applied by every replica

use shared_types::entities::{ChainHead, Hash, SignedTransaction};

/// A block in the raft-ordered chain.
///
/// Immutable once committed: `height = parent.height + 1` and
/// `parent_hash = hash(parent)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Hash of the parent block
    pub parent_hash: Hash,
    /// Height in the chain (genesis is 0)
    pub height: u64,
    /// Mint time in unix nanoseconds, strictly above the parent's
    pub timestamp: u64,
    /// Transactions in execution order
    pub transactions: Vec<SignedTransaction>,
    /// Sum of gas used by all transactions
    pub gas_used: u64,
    /// State root after executing the transactions
    pub state_root: Hash,
    /// Raft id of the minting node
    pub minter_id: u64,
}

impl Block {
    /// The genesis block for a given initial state
    pub fn genesis(state_root: Hash) -> Self {
        Self {
            parent_hash: [0u8; 32],
            height: 0,
            timestamp: 0,
            transactions: Vec::new(),
            gas_used: 0,
            state_root,
            minter_id: 0,
        }
    }

    /// Keccak-256 over the canonical encoding
    pub fn hash(&self) -> Hash {
        use sha3::{Digest, Keccak256};
        let encoded = rlp::encode(self);
        let mut hasher = Keccak256::new();
        hasher.update(&encoded);
        hasher.finalize().into()
    }

    /// Check if this is a genesis block
    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.parent_hash == [0u8; 32]
    }

    /// Head pointer for this block
    pub fn head(&self) -> ChainHead {
        ChainHead::new(self.hash(), self.height)
    }

    /// Hashes of the included transactions, in order
    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(SignedTransaction::hash).collect()
    }
}
