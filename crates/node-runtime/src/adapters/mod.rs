//! # Adapters
//!
//! Port implementations supplied by the runtime.

pub mod storage;

pub use storage::open_store;
