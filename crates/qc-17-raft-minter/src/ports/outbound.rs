//! Outbound ports (driven side - SPI)
//!
//! The minter and applier reach the transaction pool, the state database,
//! the execution engine, the block store and the raft log only through
//! these traits.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::entities::{Address, ChainHead, Hash, SignedTransaction, U256};
use thiserror::Error;

use crate::domain::Block;
use crate::error::Result;

/// Port: pending-transaction source
pub trait TxPool: Send + Sync {
    /// Pending transactions in pool order
    fn pending(&self) -> Vec<SignedTransaction>;

    /// Drop transactions that made it into a committed block
    fn remove_included(&self, hashes: &[Hash]);

    /// Number of pending transactions
    fn len(&self) -> usize;

    /// Whether the pool is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Account record held by the state database
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: U256,
    pub nonce: u64,
}

/// Port: world state
///
/// Committed state has a single writer (the applier). Everyone else works on
/// forks, which are independent copies.
pub trait StateDb: Send + Sync {
    /// Root commitment over the whole state
    fn root(&self) -> Hash;

    /// Independent copy that can be mutated without touching `self`
    fn fork(&self) -> Box<dyn StateDb>;

    /// Account at `address` (default if absent)
    fn account(&self, address: &Address) -> AccountState;

    /// Overwrite the account at `address`
    fn set_account(&mut self, address: Address, account: AccountState);
}

/// Block-level values visible to transaction execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: u64,
    pub minter_id: u64,
}

/// Deterministic transaction failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: u64, actual: u64 },

    #[error("Insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: U256, available: U256 },

    #[error("Intrinsic gas {required} exceeds limit {limit}")]
    IntrinsicGas { required: u64, limit: u64 },

    #[error("Execution failed: {0}")]
    Reverted(String),
}

/// Port: execution engine
pub trait Executor: Send + Sync {
    /// Execute one transaction, mutating `state`, and return the gas used.
    ///
    /// On error `state` must be left untouched.
    fn execute(
        &self,
        state: &mut dyn StateDb,
        tx: &SignedTransaction,
        ctx: &BlockContext,
    ) -> std::result::Result<u64, ExecutionError>;
}

/// Port: canonical block persistence
pub trait BlockStore: Send + Sync {
    /// Persist `block` as the new head together with the raft index that carried it.
    ///
    /// Block, height index, head and applied index are written atomically.
    fn put_block(&self, block: &Block, applied_index: u64) -> Result<()>;

    /// Load a block by hash
    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>>;

    /// Canonical block hash at `height`
    fn hash_at(&self, height: u64) -> Result<Option<Hash>>;

    /// Persisted head, if any block was stored
    fn head(&self) -> Result<Option<ChainHead>>;

    /// Last raft index consumed by the applier (0 if none)
    fn applied_index(&self) -> Result<u64>;

    /// Record a consumed raft index that did not produce a new head
    fn record_applied_index(&self, index: u64) -> Result<()>;

    /// Flush buffered writes
    fn flush(&self) -> Result<()>;
}

/// Hook computing the gas budget of a child of `parent`
pub type GasLimitFn = Arc<dyn Fn(&Block) -> u64 + Send + Sync>;

/// Port: submit a block to the consensus log
#[async_trait]
pub trait BlockProposer: Send + Sync {
    /// Propose `block` and wait until the log accepts it.
    ///
    /// Returns the log index. Acceptance does not mean the block won; the
    /// committed feed decides that.
    async fn propose_block(&self, block: &Block) -> Result<u64>;
}

/// Port: read-only view of the canonical chain
pub trait ChainReader: Send + Sync {
    /// Current canonical head
    fn head(&self) -> ChainHead;

    /// Recently applied block by hash
    fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>>;

    /// Consistent snapshot of the head block and the state after it
    fn state_snapshot(&self) -> (Arc<Block>, Arc<dyn StateDb>);
}
