//! Minter
//!
//! Turns pending transactions into block proposals while this node leads
//! the raft cluster. Blocks are built on the speculative chain tip so a
//! leader can keep proposing without waiting for each commit. The minter
//! never touches canonical state; it learns what won from `NewHead`.
//!
//! ## Tasks
//!
//! - **mint loop**: ticks every `block_time`, mints and proposes while
//!   leader and not paused, waiting for the proposal ack before the next tick.
//! - **event observer**: follows `NewHead`, `LeaderChanged` and `ChainSync`
//!   on the bus and re-roots the speculative chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use shared_bus::{BlockchainEvent, EventFilter, EventTopic, InMemoryEventBus, Subscription};
use shared_types::entities::SignedTransaction;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MinterConfig;
use crate::domain::{Block, PruneOutcome, SpeculativeChain};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::ports::{BlockContext, BlockProposer, ChainReader, Executor, GasLimitFn, StateDb, TxPool};

/// Gas-limit hook returning the same budget for every block
pub fn fixed_gas_limit(limit: u64) -> GasLimitFn {
    Arc::new(move |_parent: &Block| limit)
}

/// Collaborators of the [`Minter`]
pub struct MinterDeps {
    pub pool: Arc<dyn TxPool>,
    pub executor: Arc<dyn Executor>,
    pub proposer: Arc<dyn BlockProposer>,
    pub chain: Arc<dyn ChainReader>,
    pub bus: Arc<InMemoryEventBus>,
    /// Budget for a child of the given parent; defaults to `gas_floor`
    pub gas_limit: Option<GasLimitFn>,
}

/// Leader-bound block minter
pub struct Minter {
    config: MinterConfig,
    pool: Arc<dyn TxPool>,
    executor: Arc<dyn Executor>,
    proposer: Arc<dyn BlockProposer>,
    chain: Arc<dyn ChainReader>,
    bus: Arc<InMemoryEventBus>,
    gas_limit: GasLimitFn,
    speculative: Mutex<SpeculativeChain>,
    is_leader: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Minter {
    pub fn new(config: MinterConfig, deps: MinterDeps, metrics: Arc<Metrics>) -> Self {
        let (head, state) = deps.chain.state_snapshot();
        let gas_limit = deps
            .gas_limit
            .unwrap_or_else(|| fixed_gas_limit(config.gas_floor));
        Self {
            config,
            pool: deps.pool,
            executor: deps.executor,
            proposer: deps.proposer,
            chain: deps.chain,
            bus: deps.bus,
            gas_limit,
            speculative: Mutex::new(SpeculativeChain::new(head, state)),
            is_leader: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the mint loop and the event observer
    pub fn start(self: &Arc<Self>, is_leader: bool) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.is_leader.store(is_leader, Ordering::SeqCst);
        self.sync_with_chain();
        info!(
            minter_id = self.config.minter_id,
            block_time_ms = self.config.block_time_ms,
            is_leader,
            "[qc-17] minter started"
        );
        let sub = self.bus.subscribe(EventFilter::topics(vec![
            EventTopic::Chain,
            EventTopic::Consensus,
            EventTopic::Sync,
        ]));
        tasks.push(tokio::spawn(Arc::clone(self).mint_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).observe_events(sub)));
    }

    async fn mint_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.block_time());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.should_mint() {
                continue;
            }
            if let Err(err) = self.mint_new_block().await {
                if err.is_recoverable() {
                    debug!(%err, "[qc-17] proposal failed, retrying next tick");
                } else {
                    warn!(%err, "[qc-17] minting failed");
                }
            }
        }
        debug!("[qc-17] mint loop exited");
    }

    async fn observe_events(self: Arc<Self>, mut sub: Subscription) {
        let mut lagged = 0;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = sub.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if sub.lagged() != lagged {
                lagged = sub.lagged();
                warn!(lagged, "[qc-17] minter lagged behind the bus, resyncing");
                self.sync_with_chain();
            }
            match event {
                BlockchainEvent::NewHead { .. } => {
                    self.sync_with_chain();
                }
                BlockchainEvent::LeaderChanged { leader, .. } => {
                    self.on_leadership_change(leader == Some(self.config.minter_id));
                }
                BlockchainEvent::ChainSync { started } => self.set_paused(started),
                _ => {}
            }
        }
        debug!("[qc-17] event observer exited");
    }

    fn should_mint(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst) && !self.paused.load(Ordering::SeqCst)
    }

    /// Re-root the speculative chain at `block`, the newly applied head
    pub fn on_new_head(&self, block: Arc<Block>, state: Arc<dyn StateDb>) -> PruneOutcome {
        let mut speculative = self.speculative.lock();
        if block.height < speculative.root_block().height {
            return PruneOutcome::Unchanged;
        }
        let (next, outcome) = speculative.prune_to(block, state);
        *speculative = next;
        match outcome {
            PruneOutcome::Reset { dropped } if dropped > 0 => {
                self.metrics.speculative_reset();
                info!(
                    dropped,
                    head = speculative.root_block().height,
                    "[qc-17] rival block committed, speculative chain reset"
                );
            }
            PruneOutcome::Advanced { accepted } => {
                debug!(accepted, pending = speculative.len(), "[qc-17] own blocks committed");
            }
            _ => {}
        }
        outcome
    }

    fn sync_with_chain(&self) -> PruneOutcome {
        let (block, state) = self.chain.state_snapshot();
        self.on_new_head(block, state)
    }

    /// React to leadership moving to or away from this node
    pub fn on_leadership_change(&self, is_leader: bool) {
        let was_leader = self.is_leader.swap(is_leader, Ordering::SeqCst);
        if was_leader == is_leader {
            return;
        }
        let (head, state) = self.chain.state_snapshot();
        let mut speculative = self.speculative.lock();
        if !speculative.is_empty() {
            self.metrics.speculative_reset();
        }
        *speculative = SpeculativeChain::new(head, state);
        if is_leader {
            info!(minter_id = self.config.minter_id, "[qc-17] became leader, minting");
        } else {
            info!(minter_id = self.config.minter_id, "[qc-17] lost leadership, speculative chain dropped");
        }
    }

    /// Pause minting while the chain catches up
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            info!(paused, "[qc-17] minting pause toggled by chain sync");
        }
    }

    /// Assemble a block on the speculative tip and propose it.
    ///
    /// Returns `None` when nothing could be included or the tip moved
    /// underneath us.
    pub async fn mint_new_block(&self) -> Result<Option<Arc<Block>>> {
        let chain = self.speculative.lock().clone();
        let parent = Arc::clone(chain.head_block());
        let parent_hash = chain.head_hash();

        let proposed = chain.proposed_tx_hashes();
        let candidates: Vec<SignedTransaction> = self
            .pool
            .pending()
            .into_iter()
            .filter(|tx| !proposed.contains(&tx.hash()))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let budget = (self.gas_limit)(&parent);
        let ctx = BlockContext {
            height: parent.height + 1,
            timestamp: now_nanos().max(parent.timestamp + 1),
            minter_id: self.config.minter_id,
        };
        let mut state = chain.head_state().fork();
        let mut transactions = Vec::new();
        let mut gas_used = 0u64;
        for tx in candidates {
            if transactions.len() >= self.config.max_block_transactions {
                break;
            }
            if gas_used.saturating_add(tx.gas_limit) > budget {
                continue;
            }
            match self.executor.execute(state.as_mut(), &tx, &ctx) {
                Ok(gas) => {
                    gas_used += gas;
                    transactions.push(tx);
                }
                Err(err) => {
                    debug!(tx = %hex::encode(tx.hash()), %err, "[qc-17] dropping transaction");
                    self.metrics.tx_rejected();
                }
            }
        }
        if transactions.is_empty() {
            return Ok(None);
        }

        let block = Arc::new(Block {
            parent_hash,
            height: ctx.height,
            timestamp: ctx.timestamp,
            transactions,
            gas_used,
            state_root: state.root(),
            minter_id: self.config.minter_id,
        });
        let hash = block.hash();

        {
            let mut speculative = self.speculative.lock();
            if speculative.head_hash() != parent_hash {
                debug!(height = block.height, "[qc-17] tip moved while minting, abandoning block");
                return Ok(None);
            }
            match speculative.extend(Arc::clone(&block), Arc::from(state)) {
                Some(next) => *speculative = next,
                None => return Ok(None),
            }
        }

        match self.proposer.propose_block(&block).await {
            Ok(index) => {
                self.metrics.proposal_committed(block.transactions.len());
                info!(
                    height = block.height,
                    txs = block.transactions.len(),
                    gas_used = block.gas_used,
                    index,
                    "[qc-17] block proposed"
                );
                Ok(Some(block))
            }
            Err(err) => {
                self.metrics.proposal_failed(&err);
                let mut speculative = self.speculative.lock();
                if let Some(next) = speculative.discard(&hash) {
                    *speculative = next;
                }
                Err(err)
            }
        }
    }

    /// Snapshot of the speculative chain
    pub fn speculative_chain(&self) -> SpeculativeChain {
        self.speculative.lock().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop both tasks, letting an in-flight proposal finish. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(minter_id = self.config.minter_id, "[qc-17] minter stopped");
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStateDb, InMemoryTxPool, TransferExecutor};
    use crate::error::MinterError;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use shared_bus::EventPublisher;
    use shared_types::entities::{ChainHead, Hash, U256};
    use std::time::Duration;

    const ALICE: [u8; 20] = [0xA1; 20];
    const BOB: [u8; 20] = [0xB0; 20];

    #[derive(Default)]
    struct MockProposer {
        proposed: Mutex<Vec<Block>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BlockProposer for MockProposer {
        async fn propose_block(&self, block: &Block) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MinterError::ProposalTimeout { timeout_ms: 10 });
            }
            let mut proposed = self.proposed.lock();
            proposed.push(block.clone());
            Ok(proposed.len() as u64)
        }
    }

    struct MockChain {
        snapshot: RwLock<(Arc<Block>, Arc<dyn StateDb>)>,
    }

    impl MockChain {
        fn genesis() -> Self {
            let state = InMemoryStateDb::with_balances(&[(ALICE, U256::from(10_000_000u64))]);
            let block = Arc::new(Block::genesis(state.root()));
            Self {
                snapshot: RwLock::new((block, Arc::new(state))),
            }
        }

        fn commit(&self, block: Arc<Block>, state: Arc<dyn StateDb>) {
            *self.snapshot.write() = (block, state);
        }
    }

    impl ChainReader for MockChain {
        fn head(&self) -> ChainHead {
            self.snapshot.read().0.head()
        }

        fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
            let block = Arc::clone(&self.snapshot.read().0);
            (block.hash() == *hash).then_some(block)
        }

        fn state_snapshot(&self) -> (Arc<Block>, Arc<dyn StateDb>) {
            let snapshot = self.snapshot.read();
            (Arc::clone(&snapshot.0), Arc::clone(&snapshot.1))
        }
    }

    struct Fixture {
        minter: Arc<Minter>,
        pool: Arc<InMemoryTxPool>,
        proposer: Arc<MockProposer>,
        chain: Arc<MockChain>,
        bus: Arc<InMemoryEventBus>,
    }

    fn fixture_with(config: MinterConfig, gas_limit: Option<GasLimitFn>) -> Fixture {
        let pool = Arc::new(InMemoryTxPool::new());
        let proposer = Arc::new(MockProposer::default());
        let chain = Arc::new(MockChain::genesis());
        let bus = Arc::new(InMemoryEventBus::new());
        let minter = Arc::new(Minter::new(
            config,
            MinterDeps {
                pool: Arc::clone(&pool) as Arc<dyn TxPool>,
                executor: Arc::new(TransferExecutor),
                proposer: Arc::clone(&proposer) as Arc<dyn BlockProposer>,
                chain: Arc::clone(&chain) as Arc<dyn ChainReader>,
                bus: Arc::clone(&bus),
                gas_limit,
            },
            Arc::new(Metrics::new()),
        ));
        Fixture {
            minter,
            pool,
            proposer,
            chain,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MinterConfig::default(), None)
    }

    fn transfer(nonce: u64) -> SignedTransaction {
        SignedTransaction {
            from: ALICE,
            to: Some(BOB),
            value: U256::from(1u64),
            nonce,
            gas_price: U256::zero(),
            gas_limit: 21_000,
            data: vec![],
            signature: [0u8; 64],
        }
    }

    #[tokio::test]
    async fn test_mint_builds_on_speculative_tip() {
        let f = fixture();
        f.pool.add(transfer(0));
        f.pool.add(transfer(1));

        let first = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(first.height, 1);
        assert_eq!(first.transactions.len(), 2);
        assert_eq!(first.gas_used, 42_000);

        // Both are still pending in the pool but already proposed.
        f.pool.add(transfer(2));
        let second = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(second.parent_hash, first.hash());
        assert_eq!(second.transactions, vec![transfer(2)]);
        assert!(second.timestamp > first.timestamp);

        assert_eq!(f.minter.speculative_chain().len(), 2);
        assert_eq!(f.proposer.proposed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_transactions_are_dropped() {
        let f = fixture();
        f.pool.add(transfer(7));
        assert!(f.minter.mint_new_block().await.unwrap().is_none());

        f.pool.add(transfer(0));
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(block.transactions, vec![transfer(0)]);
        assert_eq!(f.minter.metrics().snapshot().txs_rejected, 2);
    }

    #[tokio::test]
    async fn test_gas_budget_limits_block() {
        let f = fixture_with(MinterConfig::default(), Some(fixed_gas_limit(50_000)));
        for nonce in 0..3 {
            f.pool.add(transfer(nonce));
        }
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(block.transactions.len(), 2);
    }

    #[tokio::test]
    async fn test_max_transactions_cap() {
        let config = MinterConfig {
            max_block_transactions: 1,
            ..MinterConfig::default()
        };
        let f = fixture_with(config, None);
        f.pool.add(transfer(0));
        f.pool.add(transfer(1));
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_mints_nothing() {
        let f = fixture();
        assert!(f.minter.mint_new_block().await.unwrap().is_none());
        assert!(f.proposer.proposed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_proposal_is_discarded() {
        let f = fixture();
        f.pool.add(transfer(0));
        f.proposer.fail.store(true, Ordering::SeqCst);

        let err = f.minter.mint_new_block().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(f.minter.speculative_chain().is_empty());
        assert_eq!(f.minter.metrics().snapshot().proposal_timeouts, 1);

        f.proposer.fail.store(false, Ordering::SeqCst);
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(f.minter.metrics().snapshot().proposals_committed, 1);
    }

    #[tokio::test]
    async fn test_own_block_commit_advances_root() {
        let f = fixture();
        f.pool.add(transfer(0));
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        let state = f.minter.speculative_chain().head_state();

        let outcome = f.minter.on_new_head(Arc::clone(&block), state);
        assert_eq!(outcome, PruneOutcome::Advanced { accepted: 1 });
        assert!(f.minter.speculative_chain().is_empty());
        assert_eq!(f.minter.speculative_chain().root_hash(), block.hash());
    }

    #[tokio::test]
    async fn test_rival_commit_resets_chain() {
        let f = fixture();
        f.pool.add(transfer(0));
        f.minter.mint_new_block().await.unwrap().unwrap();

        let (genesis, genesis_state) = f.chain.state_snapshot();
        let rival = Arc::new(Block {
            parent_hash: genesis.hash(),
            height: 1,
            timestamp: 5,
            transactions: vec![],
            gas_used: 0,
            state_root: genesis_state.root(),
            minter_id: 2,
        });
        f.chain.commit(Arc::clone(&rival), Arc::clone(&genesis_state));

        let outcome = f.minter.on_new_head(Arc::clone(&rival), genesis_state);
        assert_eq!(outcome, PruneOutcome::Reset { dropped: 1 });
        assert_eq!(f.minter.speculative_chain().head_hash(), rival.hash());

        // The transaction is proposable again on top of the rival.
        let block = f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(block.parent_hash, rival.hash());
        assert_eq!(block.transactions, vec![transfer(0)]);
    }

    #[tokio::test]
    async fn test_demotion_drops_speculative_chain() {
        let f = fixture();
        f.minter.on_leadership_change(true);
        f.pool.add(transfer(0));
        f.minter.mint_new_block().await.unwrap().unwrap();
        assert_eq!(f.minter.speculative_chain().len(), 1);

        f.minter.on_leadership_change(false);
        assert!(!f.minter.is_leader());
        assert!(f.minter.speculative_chain().is_empty());
        assert_eq!(f.minter.metrics().snapshot().speculative_resets, 1);
    }

    #[tokio::test]
    async fn test_leader_mints_on_tick_and_stops() {
        let config = MinterConfig {
            block_time_ms: 10,
            ..MinterConfig::default()
        };
        let f = fixture_with(config, None);
        f.pool.add(transfer(0));
        f.minter.start(true);

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.proposer.proposed.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never minted");

        f.minter.stop().await;
        f.minter.stop().await;
        assert_eq!(f.minter.metrics().snapshot().proposals_committed, 1);
    }

    #[tokio::test]
    async fn test_follower_does_not_mint() {
        let config = MinterConfig {
            block_time_ms: 5,
            ..MinterConfig::default()
        };
        let f = fixture_with(config, None);
        f.pool.add(transfer(0));
        f.minter.start(false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.minter.stop().await;
        assert!(f.proposer.proposed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bus_events_drive_leadership_and_pause() {
        let f = fixture();
        f.minter.start(false);

        f.bus
            .publish(BlockchainEvent::LeaderChanged {
                leader: Some(1),
                term: 2,
            })
            .await;
        f.bus
            .publish(BlockchainEvent::ChainSync { started: true })
            .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !(f.minter.is_leader() && f.minter.is_paused()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events not observed");
        f.minter.stop().await;
    }
}
