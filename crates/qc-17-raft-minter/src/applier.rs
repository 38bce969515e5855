//! Block applier
//!
//! The only writer of canonical state. Consumes committed raft entries in
//! log order, executes each block against the state after the head, checks
//! the declared state root, persists the block and publishes `NewHead`.
//!
//! ## Rules per committed block
//!
//! | Block                                        | Outcome                     |
//! |----------------------------------------------|-----------------------------|
//! | parent = head, height = head + 1             | executed and applied        |
//! | parent already applied, height <= head       | rival; discarded            |
//! | anything else                                | `ForkedApply` (fatal)       |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use shared_bus::{BlockchainEvent, EventPublisher};
use shared_types::entities::{ChainHead, Hash};
use shared_types::CacheCapability;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{decode_block, Block};
use crate::error::{MinterError, Result};
use crate::metrics::Metrics;
use crate::ports::{BlockContext, BlockStore, ChainReader, Executor, StateDb, TxPool};
use crate::raft::{EntryKind, RaftEntry, RaftProtocolManager};
use crate::SUBSYSTEM_ID;

/// What a committed entry did to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The block became the new head
    Applied(ChainHead),
    /// A rival block lost the race and was discarded
    Rival { height: u64 },
    /// A membership entry was applied
    Membership,
    /// The entry was already applied before a restart
    Skipped,
}

struct Canonical {
    block: Arc<Block>,
    state: Arc<dyn StateDb>,
}

/// Deterministic consumer of the committed feed
pub struct BlockApplier {
    store: Arc<dyn BlockStore>,
    executor: Arc<dyn Executor>,
    pool: Arc<dyn TxPool>,
    bus: Arc<dyn EventPublisher>,
    recent: Arc<dyn CacheCapability<Hash, Arc<Block>>>,
    membership: Option<Arc<RaftProtocolManager>>,
    canonical: RwLock<Canonical>,
    head_tx: watch::Sender<ChainHead>,
    applied_index: AtomicU64,
    metrics: Arc<Metrics>,
}

impl BlockApplier {
    /// Open the applier over `store`.
    ///
    /// An empty store is initialised with a genesis block committing to
    /// `genesis_state`. Otherwise the stored chain is replayed on top of
    /// `genesis_state` to rebuild the state after the head.
    pub fn open(
        store: Arc<dyn BlockStore>,
        executor: Arc<dyn Executor>,
        pool: Arc<dyn TxPool>,
        bus: Arc<dyn EventPublisher>,
        recent: Arc<dyn CacheCapability<Hash, Arc<Block>>>,
        genesis_state: Box<dyn StateDb>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let genesis_state: Arc<dyn StateDb> = Arc::from(genesis_state);
        let (block, state) = match store.head()? {
            None => {
                let genesis = Block::genesis(genesis_state.root());
                store.put_block(&genesis, 0)?;
                info!(root = %hex::encode(genesis.state_root), "[qc-17] genesis initialised");
                (Arc::new(genesis), genesis_state)
            }
            Some(head) => {
                let recovered = Self::replay(store.as_ref(), executor.as_ref(), genesis_state, head)?;
                info!(height = head.height, "[qc-17] chain recovered from store");
                recovered
            }
        };

        let head = block.head();
        recent.insert(head.block_hash, Arc::clone(&block));
        let (head_tx, _) = watch::channel(head);
        let applied_index = store.applied_index()?;

        Ok(Self {
            store,
            executor,
            pool,
            bus,
            recent,
            membership: None,
            canonical: RwLock::new(Canonical { block, state }),
            head_tx,
            applied_index: AtomicU64::new(applied_index),
            metrics,
        })
    }

    /// Route committed membership entries to `manager`
    pub fn with_membership(mut self, manager: Arc<RaftProtocolManager>) -> Self {
        self.membership = Some(manager);
        self
    }

    fn replay(
        store: &dyn BlockStore,
        executor: &dyn Executor,
        genesis_state: Arc<dyn StateDb>,
        head: ChainHead,
    ) -> Result<(Arc<Block>, Arc<dyn StateDb>)> {
        let genesis = load_at(store, 0)?;
        if genesis.state_root != genesis_state.root() {
            return Err(MinterError::StateRootMismatch {
                height: 0,
                declared: hex::encode(genesis.state_root),
                computed: hex::encode(genesis_state.root()),
            });
        }

        let mut block = genesis;
        let mut state = genesis_state;
        for height in 1..=head.height {
            let next = load_at(store, height)?;
            if next.parent_hash != block.hash() {
                return Err(forked(&next, &block.hash()));
            }
            state = Arc::from(execute_block(executor, state.as_ref(), &next)?);
            block = next;
        }
        if block.hash() != head.block_hash {
            return Err(MinterError::Storage(shared_types::StoreError::corruption(
                "stored head does not match height index",
            )));
        }
        Ok((Arc::new(block), state))
    }

    /// Last raft index consumed
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Watch the canonical head
    pub fn subscribe_head(&self) -> watch::Receiver<ChainHead> {
        self.head_tx.subscribe()
    }

    /// Apply one committed entry
    pub async fn apply_entry(&self, entry: &RaftEntry) -> Result<ApplyOutcome> {
        if entry.index <= self.applied_index() {
            return Ok(ApplyOutcome::Skipped);
        }
        match entry.kind {
            EntryKind::ConfChange => {
                if let Some(manager) = &self.membership {
                    if let Err(err) = manager.apply_membership(entry) {
                        warn!(index = entry.index, %err, "[qc-17] ignoring undecodable membership entry");
                    }
                }
                self.store.record_applied_index(entry.index)?;
                self.applied_index.store(entry.index, Ordering::SeqCst);
                Ok(ApplyOutcome::Membership)
            }
            EntryKind::Normal => {
                let block = decode_block(&entry.data).map_err(|err| {
                    MinterError::InvalidCommittedBlock {
                        height: self.head().height + 1,
                        reason: err.to_string(),
                    }
                })?;
                self.apply_block(block, entry.index).await
            }
        }
    }

    async fn apply_block(&self, block: Block, index: u64) -> Result<ApplyOutcome> {
        let (head_block, state) = self.state_snapshot();
        let head_hash = head_block.hash();

        if block.parent_hash != head_hash || block.height != head_block.height + 1 {
            if block.height <= head_block.height && self.is_applied(&block.parent_hash)? {
                warn!(
                    height = block.height,
                    minter = block.minter_id,
                    "[qc-17] discarding rival block"
                );
                self.store.record_applied_index(index)?;
                self.applied_index.store(index, Ordering::SeqCst);
                self.metrics.rival_discarded();
                return Ok(ApplyOutcome::Rival {
                    height: block.height,
                });
            }
            return Err(forked(&block, &head_hash));
        }

        let next_state = execute_block(self.executor.as_ref(), state.as_ref(), &block)?;
        self.store.put_block(&block, index)?;

        let block = Arc::new(block);
        let head = block.head();
        {
            let mut canonical = self.canonical.write();
            canonical.block = Arc::clone(&block);
            canonical.state = Arc::from(next_state);
        }
        self.applied_index.store(index, Ordering::SeqCst);
        self.head_tx.send_replace(head);
        self.recent.insert(head.block_hash, Arc::clone(&block));
        self.pool.remove_included(&block.tx_hashes());
        self.metrics.block_applied();

        debug!(height = head.height, index, txs = block.transactions.len(), "[qc-17] block applied");
        self.bus
            .publish(BlockchainEvent::NewHead {
                head,
                tx_count: block.transactions.len(),
                minter_id: block.minter_id,
            })
            .await;
        Ok(ApplyOutcome::Applied(head))
    }

    fn is_applied(&self, hash: &Hash) -> Result<bool> {
        if self.recent.contains(hash) {
            return Ok(true);
        }
        Ok(self.store.block_by_hash(hash)?.is_some())
    }

    /// Consume `feed` until it closes or `cancel` fires.
    ///
    /// A fatal error is published as `CriticalError` and ends the loop.
    pub async fn run(
        self: Arc<Self>,
        mut feed: mpsc::Receiver<RaftEntry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(from = self.applied_index() + 1, "[qc-17] apply loop started");
        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                entry = feed.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            match self.apply_entry(&entry).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    error!(index = entry.index, %err, "[qc-17] fatal apply error, stopping");
                    self.bus
                        .publish(BlockchainEvent::CriticalError {
                            subsystem_id: SUBSYSTEM_ID,
                            error: err.to_string(),
                        })
                        .await;
                    return Err(err);
                }
                Err(err) => warn!(index = entry.index, %err, "[qc-17] apply error"),
            }
        }
        info!(applied = self.applied_index(), "[qc-17] apply loop stopped");
        Ok(())
    }
}

impl ChainReader for BlockApplier {
    fn head(&self) -> ChainHead {
        *self.head_tx.borrow()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        if let Some(block) = self.recent.get(hash) {
            return Some(block);
        }
        match self.store.block_by_hash(hash) {
            Ok(block) => block.map(Arc::new),
            Err(err) => {
                warn!(%err, "[qc-17] block lookup failed");
                None
            }
        }
    }

    fn state_snapshot(&self) -> (Arc<Block>, Arc<dyn StateDb>) {
        let canonical = self.canonical.read();
        (Arc::clone(&canonical.block), Arc::clone(&canonical.state))
    }
}

/// Execute `block` on a fork of `state` and check the declared root and gas.
pub(crate) fn execute_block(
    executor: &dyn Executor,
    state: &dyn StateDb,
    block: &Block,
) -> Result<Box<dyn StateDb>> {
    let mut next = state.fork();
    let ctx = BlockContext {
        height: block.height,
        timestamp: block.timestamp,
        minter_id: block.minter_id,
    };
    let mut gas_used = 0u64;
    for tx in &block.transactions {
        gas_used += executor.execute(next.as_mut(), tx, &ctx).map_err(|err| {
            MinterError::InvalidCommittedBlock {
                height: block.height,
                reason: err.to_string(),
            }
        })?;
    }
    if gas_used != block.gas_used {
        return Err(MinterError::InvalidCommittedBlock {
            height: block.height,
            reason: format!("declared gas {} but used {}", block.gas_used, gas_used),
        });
    }
    let computed = next.root();
    if computed != block.state_root {
        return Err(MinterError::StateRootMismatch {
            height: block.height,
            declared: hex::encode(block.state_root),
            computed: hex::encode(computed),
        });
    }
    Ok(next)
}

fn load_at(store: &dyn BlockStore, height: u64) -> Result<Block> {
    let hash = store.hash_at(height)?.ok_or_else(|| {
        shared_types::StoreError::corruption(format!("missing height index {height}"))
    })?;
    store
        .block_by_hash(&hash)?
        .ok_or_else(|| shared_types::StoreError::corruption(format!("missing block {height}")).into())
}

fn forked(block: &Block, head: &Hash) -> MinterError {
    MinterError::ForkedApply {
        height: block.height,
        parent: hex::encode(block.parent_hash),
        head: hex::encode(head),
    }
}
