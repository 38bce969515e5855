//! # Node Runtime Library
//!
//! Configuration, storage backends and subsystem wiring of a node. The
//! entry point is the `main.rs` binary; the library exists so the pieces
//! can be tested and reused by the integration suite.
//!
//! ## Architectural Patterns
//!
//! - **EDA (Event-Driven Architecture)**: the two subsystems meet only on the Event Bus
//! - **Hexagonal Architecture**: Ports define contracts, Adapters implement them

#![allow(clippy::type_complexity)]

pub mod adapters;
pub mod container;
pub mod telemetry;

pub use container::{ConfigError, GenesisAccount, NodeConfig, SubsystemContainer};
