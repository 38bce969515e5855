//! Domain layer - blocks, their encoding, and the speculative chain
//!
//! Everything here is synchronous and free of I/O.
//!
//! - [`Block`]: the unit of replication
//! - [`codec`]: canonical RLP encoding of blocks and membership changes
//! - [`SpeculativeChain`]: proposed-but-uncommitted blocks above the head

mod block;
pub mod codec;
mod speculative;

pub use block::Block;
pub use codec::{decode_block, encode_block};
pub use speculative::{PruneOutcome, SpeculativeChain};
