//! Ports layer - Hexagonal architecture interfaces

pub mod outbound;

pub use outbound::*;
