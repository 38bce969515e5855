//! Cross-crate integration scenarios

pub mod fixtures;

#[cfg(test)]
mod chunk_streams;
#[cfg(test)]
mod keyed_cache;
#[cfg(test)]
mod node_wiring;
#[cfg(test)]
mod raft_minting;
#[cfg(test)]
mod syncer_chain;
