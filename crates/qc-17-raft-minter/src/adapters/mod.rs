//! Adapters layer - concrete implementations of the outbound ports

pub mod block_store;
pub mod memory;

pub use block_store::KvBlockStore;
pub use memory::{InMemoryStateDb, InMemoryTxPool, TransferExecutor};
