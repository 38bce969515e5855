//! Port implementations: key-value backed stores and an in-process transport

pub mod chunk_store;
pub mod interval_store;
pub mod transport;

pub use chunk_store::KvChunkStore;
pub use interval_store::IntervalStore;
pub use transport::duplex;
