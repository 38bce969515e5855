//! Domain layer: stream descriptors, interval sets, protocol messages and
//! overlay proximity.

pub mod intervals;
pub mod kademlia;
pub mod messages;
pub mod stream;

pub use intervals::Intervals;
pub use messages::{
    HandoverProof, Message, OfferedHashes, Side, TakeoverProof, WantedHashes,
};
pub use stream::{Priority, Range, Stream};
