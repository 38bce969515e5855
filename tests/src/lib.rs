//! # Quantum-Chain Test Suite
//!
//! Cross-crate scenarios for the raft minter (qc-17), the chunk-sync
//! streamer (qc-05) and the node runtime.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs         # Multi-node harnesses and test stream handlers
//!     ├── raft_minting.rs     # S1 leader minting, S2 leader change
//!     ├── chunk_streams.rs    # S3 history, S4 live, S5 both, resumption
//!     ├── syncer_chain.rs     # SYNC replication along a chain of nodes
//!     ├── keyed_cache.rs      # S6 LRU cap
//!     └── node_wiring.rs      # Two node-runtime containers side by side
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p qc-tests
//! cargo test -p qc-tests integration::chunk_streams::
//! ```

#![allow(dead_code)]

pub mod integration;
