//! Overlay proximity - pure functions over the XOR metric
//!
//! All functions in this module are pure and deterministic.

use shared_types::{distance_cmp, proximity, ChunkAddress, NodeId};

/// Highest bin tracked; closer addresses share it
pub const MAX_PO: u8 = 16;

/// Proximity bin of `addr` relative to `base`, capped at [`MAX_PO`]
pub fn proximity_bin(base: &NodeId, addr: &ChunkAddress) -> u8 {
    proximity(base.as_bytes(), addr).min(MAX_PO as usize) as u8
}

/// Closest candidate to `target` by XOR distance, skipping `exclude`.
///
/// Ties cannot occur between distinct ids.
pub fn closest_peer<I>(target: &ChunkAddress, candidates: I, exclude: Option<&NodeId>) -> Option<NodeId>
where
    I: IntoIterator<Item = NodeId>,
{
    candidates
        .into_iter()
        .filter(|peer| Some(peer) != exclude)
        .min_by(|a, b| distance_cmp(target, a.as_bytes(), b.as_bytes()))
}
