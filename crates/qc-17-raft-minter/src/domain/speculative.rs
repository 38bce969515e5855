//! Speculative chain: locally proposed blocks not yet committed
//!
//! An immutable linked list growing from the last committed head. Every
//! operation returns a new chain; the minter swaps the whole value in one
//! step, so a reader never sees a half-updated chain.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use shared_types::entities::Hash;

use super::block::Block;
use crate::ports::StateDb;

struct Link {
    block: Arc<Block>,
    hash: Hash,
    state: Arc<dyn StateDb>,
    parent: Option<Arc<Link>>,
}

/// Result of pruning the chain against a committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The committed block already is the root
    Unchanged,
    /// The committed block was one of ours; `accepted` links became canonical
    Advanced { accepted: usize },
    /// The committed block was not ours; `dropped` links were thrown away
    Reset { dropped: usize },
}

/// Immutable chain of speculative blocks rooted at a committed block
#[derive(Clone)]
pub struct SpeculativeChain {
    tip: Arc<Link>,
}

impl SpeculativeChain {
    /// A chain holding only the committed `root`
    pub fn new(root: Arc<Block>, state: Arc<dyn StateDb>) -> Self {
        let hash = root.hash();
        Self {
            tip: Arc::new(Link {
                block: root,
                hash,
                state,
                parent: None,
            }),
        }
    }

    /// Block at the tip (the parent of the next minted block)
    pub fn head_block(&self) -> &Arc<Block> {
        &self.tip.block
    }

    /// Hash of the tip
    pub fn head_hash(&self) -> Hash {
        self.tip.hash
    }

    /// State after executing the tip
    pub fn head_state(&self) -> Arc<dyn StateDb> {
        Arc::clone(&self.tip.state)
    }

    /// The committed root
    pub fn root_block(&self) -> &Arc<Block> {
        &self.root().block
    }

    /// Hash of the committed root
    pub fn root_hash(&self) -> Hash {
        self.root().hash
    }

    /// Number of speculative blocks above the root
    pub fn len(&self) -> usize {
        self.links().count() - 1
    }

    /// Whether nothing is pending above the root
    pub fn is_empty(&self) -> bool {
        self.tip.parent.is_none()
    }

    /// Append `block` on top of the tip.
    ///
    /// Returns `None` if `block` does not reference the tip as parent.
    pub fn extend(&self, block: Arc<Block>, state: Arc<dyn StateDb>) -> Option<Self> {
        if block.parent_hash != self.tip.hash || block.height != self.tip.block.height + 1 {
            return None;
        }
        let hash = block.hash();
        Some(Self {
            tip: Arc::new(Link {
                block,
                hash,
                state,
                parent: Some(Arc::clone(&self.tip)),
            }),
        })
    }

    /// Re-root the chain at `committed`.
    ///
    /// If `committed` is one of our links, everything up to it becomes the new
    /// root and the links above it survive. Otherwise the whole chain is
    /// replaced by `committed` alone.
    pub fn prune_to(&self, committed: Arc<Block>, state: Arc<dyn StateDb>) -> (Self, PruneOutcome) {
        let hash = committed.hash();
        if hash == self.root_hash() {
            return (self.clone(), PruneOutcome::Unchanged);
        }

        // Links strictly above `committed`, tip first.
        let mut above = Vec::new();
        let mut found = None;
        for link in self.links() {
            if link.hash == hash {
                found = Some(link);
                break;
            }
            above.push(link);
        }

        match found {
            Some(link) if link.parent.is_some() => {
                let accepted = self.len() - above.len();
                let mut chain = SpeculativeChain::new(Arc::clone(&link.block), Arc::clone(&link.state));
                for link in above.into_iter().rev() {
                    chain = SpeculativeChain {
                        tip: Arc::new(Link {
                            block: Arc::clone(&link.block),
                            hash: link.hash,
                            state: Arc::clone(&link.state),
                            parent: Some(chain.tip),
                        }),
                    };
                }
                (chain, PruneOutcome::Advanced { accepted })
            }
            _ => (
                SpeculativeChain::new(committed, state),
                PruneOutcome::Reset { dropped: self.len() },
            ),
        }
    }

    /// Drop the link with `hash` and everything above it.
    ///
    /// Returns `None` if `hash` is not a speculative link.
    pub fn discard(&self, hash: &Hash) -> Option<Self> {
        let link = self.links().find(|link| link.hash == *hash)?;
        let parent = link.parent.as_ref()?;
        Some(Self {
            tip: Arc::clone(parent),
        })
    }

    /// Hashes of transactions in speculative blocks (root excluded)
    pub fn proposed_tx_hashes(&self) -> HashSet<Hash> {
        self.links()
            .filter(|link| link.parent.is_some())
            .flat_map(|link| link.block.tx_hashes())
            .collect()
    }

    /// Speculative block hashes, oldest first
    pub fn pending_hashes(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self
            .links()
            .filter(|link| link.parent.is_some())
            .map(|link| link.hash)
            .collect();
        hashes.reverse();
        hashes
    }

    fn root(&self) -> &Link {
        let mut link = self.tip.as_ref();
        while let Some(parent) = &link.parent {
            link = parent;
        }
        link
    }

    fn links(&self) -> impl Iterator<Item = &Arc<Link>> {
        std::iter::successors(Some(&self.tip), |link| link.parent.as_ref())
    }
}

impl fmt::Debug for SpeculativeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeculativeChain")
            .field("root_height", &self.root_block().height)
            .field("tip_height", &self.tip.block.height)
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStateDb;

    fn state() -> Arc<dyn StateDb> {
        Arc::new(InMemoryStateDb::new())
    }

    fn child(parent: &Block, minter_id: u64) -> Arc<Block> {
        Arc::new(Block {
            parent_hash: parent.hash(),
            height: parent.height + 1,
            timestamp: parent.timestamp + 1,
            transactions: Vec::new(),
            gas_used: 0,
            state_root: parent.state_root,
            minter_id,
        })
    }

    fn chain_of(n: usize) -> (SpeculativeChain, Vec<Arc<Block>>) {
        let genesis = Arc::new(Block::genesis([0u8; 32]));
        let mut chain = SpeculativeChain::new(Arc::clone(&genesis), state());
        let mut blocks = vec![genesis];
        for _ in 0..n {
            let next = child(blocks.last().unwrap(), 1);
            chain = chain.extend(Arc::clone(&next), state()).unwrap();
            blocks.push(next);
        }
        (chain, blocks)
    }

    #[test]
    fn test_extend_requires_tip_parent() {
        let (chain, blocks) = chain_of(2);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.head_hash(), blocks[2].hash());
        assert!(chain.extend(child(&blocks[1], 1), state()).is_none());
    }

    #[test]
    fn test_prune_to_own_block_keeps_descendants() {
        let (chain, blocks) = chain_of(3);
        let (pruned, outcome) = chain.prune_to(Arc::clone(&blocks[1]), state());
        assert_eq!(outcome, PruneOutcome::Advanced { accepted: 1 });
        assert_eq!(pruned.root_hash(), blocks[1].hash());
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned.head_hash(), blocks[3].hash());
        // Original value is untouched.
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_prune_to_rival_resets() {
        let (chain, blocks) = chain_of(2);
        let rival = child(&blocks[0], 2);
        let (pruned, outcome) = chain.prune_to(Arc::clone(&rival), state());
        assert_eq!(outcome, PruneOutcome::Reset { dropped: 2 });
        assert!(pruned.is_empty());
        assert_eq!(pruned.head_hash(), rival.hash());
    }

    #[test]
    fn test_prune_to_root_is_unchanged() {
        let (chain, blocks) = chain_of(1);
        let (_, outcome) = chain.prune_to(Arc::clone(&blocks[0]), state());
        assert_eq!(outcome, PruneOutcome::Unchanged);
    }

    #[test]
    fn test_discard_drops_descendants() {
        let (chain, blocks) = chain_of(3);
        let trimmed = chain.discard(&blocks[2].hash()).unwrap();
        assert_eq!(trimmed.head_hash(), blocks[1].hash());
        assert!(chain.discard(&blocks[0].hash()).is_none());
        assert!(chain.discard(&[9u8; 32]).is_none());
    }

    #[test]
    fn test_pending_hashes_oldest_first() {
        let (chain, blocks) = chain_of(2);
        assert_eq!(chain.pending_hashes(), vec![blocks[1].hash(), blocks[2].hash()]);
        assert!(chain.proposed_tx_hashes().is_empty());
    }
}
