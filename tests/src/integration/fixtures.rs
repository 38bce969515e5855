//! # Test Fixtures
//!
//! Harnesses shared by the integration scenarios:
//!
//! - [`RaftNode`] / [`raft_cluster`]: raft minters sharing one in-process log
//! - [`ChunkNode`] / [`chunk_node`]: chunk-sync registries over in-memory stores
//! - [`TestServer`] / [`TestClient`]: a synthetic `TEST` stream

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use qc_05_chunk_sync::{
    duplex, ChunkStore, Client, FetchFuture, KvChunkStore, OfferedHashes, Registry,
    RegistryOptions, Server, Stream, Syncing,
};
use qc_17_raft_minter::adapters::{InMemoryStateDb, InMemoryTxPool, KvBlockStore, TransferExecutor};
use qc_17_raft_minter::ports::BlockStore;
use qc_17_raft_minter::{Block, InMemoryRaftCluster, RaftDeps, RaftService, RaftServiceConfig};
use shared_bus::InMemoryEventBus;
use shared_types::{Address, ChunkAddress, Hash, InMemoryKVStore, NodeId, SignedTransaction, U256};

/// Upper bound on any wait in a scenario
pub const WAIT: Duration = Duration::from_secs(10);

/// Funded in every raft node's genesis state
pub const ALICE: Address = [0xA1; 20];

/// Poll `check` until it holds, panicking after [`WAIT`]
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

// =============================================================================
// Raft minting
// =============================================================================

/// A raft minter with its own pool and block store
pub struct RaftNode {
    pub id: u64,
    pub service: RaftService,
    pub pool: Arc<InMemoryTxPool>,
    pub blocks: Arc<KvBlockStore>,
    pub bus: Arc<InMemoryEventBus>,
}

impl RaftNode {
    /// Block at `height` on this node's chain
    pub fn block_at(&self, height: u64) -> Option<Block> {
        let hash = self.blocks.hash_at(height).ok()??;
        self.blocks.block_by_hash(&hash).ok()?
    }

    pub fn hash_at(&self, height: u64) -> Option<Hash> {
        self.blocks.hash_at(height).ok()?
    }

    /// Transaction hashes of blocks `1..=head`, in chain order
    pub fn chain_tx_hashes(&self) -> Vec<Hash> {
        (1..=self.service.head().height)
            .filter_map(|height| self.block_at(height))
            .flat_map(|block| block.tx_hashes())
            .collect()
    }
}

/// `ids.len()` started minters on one cluster; the first id is elected
pub fn raft_cluster(ids: &[u64]) -> (InMemoryRaftCluster, Vec<RaftNode>) {
    let cluster = InMemoryRaftCluster::new();
    let logs: Vec<_> = ids.iter().map(|&id| cluster.add_node(id)).collect();
    if let Some(&first) = ids.first() {
        cluster.elect(first);
    }

    let nodes = ids
        .iter()
        .zip(logs)
        .map(|(&id, log)| {
            let mut config = RaftServiceConfig::default();
            config.minter.minter_id = id;
            config.raft.raft_id = id;
            config.raft.proposal_timeout_ms = 5_000;

            let pool = Arc::new(InMemoryTxPool::new());
            let blocks = Arc::new(KvBlockStore::new(Arc::new(InMemoryKVStore::new())));
            let bus = Arc::new(InMemoryEventBus::new());
            let service = RaftService::new(
                config,
                RaftDeps {
                    log,
                    pool: Arc::clone(&pool) as _,
                    executor: Arc::new(TransferExecutor),
                    store: Arc::clone(&blocks) as _,
                    genesis_state: Box::new(InMemoryStateDb::with_balances(&[(
                        ALICE,
                        U256::from(1_000_000_000u64),
                    )])),
                    bus: Arc::clone(&bus),
                    gas_limit: None,
                },
            )
            .expect("raft service");
            service.start().expect("raft start");
            RaftNode {
                id,
                service,
                pool,
                blocks,
                bus,
            }
        })
        .collect();
    (cluster, nodes)
}

/// A 21000-gas transfer from [`ALICE`]
pub fn transfer(nonce: u64, to: u8) -> SignedTransaction {
    SignedTransaction {
        from: ALICE,
        to: Some([to; 20]),
        value: U256::from(10u64),
        nonce,
        gas_price: U256::zero(),
        gas_limit: 21_000,
        data: vec![],
        signature: [0u8; 64],
    }
}

// =============================================================================
// Chunk streaming
// =============================================================================

pub const TEST_KIND: &str = "TEST";

/// Where [`TestServer`] fixes its session
pub const SESSION_AT: u64 = 50;

/// Highest index [`TestServer`] offers
pub const MAX_KEYS: u64 = 100;

/// Key of index `i` in the `TEST` stream
pub fn test_key(index: u64) -> ChunkAddress {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&index.to_be_bytes());
    key
}

pub fn index_of(key: &ChunkAddress) -> u64 {
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[..8]);
    u64::from_be_bytes(be)
}

/// Session at 50, keys `0..=100`, 4 KiB of zeros behind each
pub struct TestServer;

#[async_trait]
impl Server for TestServer {
    fn session_index(&self) -> qc_05_chunk_sync::Result<u64> {
        Ok(SESSION_AT)
    }

    async fn set_next_batch(&self, from: u64, to: u64) -> qc_05_chunk_sync::Result<OfferedHashes> {
        let to = to.min(MAX_KEYS);
        if from > to {
            return Ok(OfferedHashes::empty(from));
        }
        let keys: Vec<_> = (from..=to).map(|i| (i, test_key(i))).collect();
        Ok(OfferedHashes::from_keys(&keys, from))
    }

    async fn get_data(&self, _key: &ChunkAddress) -> qc_05_chunk_sync::Result<Bytes> {
        Ok(Bytes::from(vec![0u8; 4096]))
    }
}

/// Wants every key the local store lacks and reports it
pub struct TestClient {
    store: Arc<dyn ChunkStore>,
    asked: mpsc::UnboundedSender<ChunkAddress>,
}

impl Client for TestClient {
    fn need_data(&self, key: &ChunkAddress) -> Option<FetchFuture> {
        let fetch = self.store.fetch_func(key)?;
        let _ = self.asked.send(*key);
        Some(fetch)
    }
}

pub struct ChunkNode {
    pub id: NodeId,
    pub registry: Arc<Registry>,
    pub bus: Arc<InMemoryEventBus>,
    pub asked: mpsc::UnboundedReceiver<ChunkAddress>,
}

impl ChunkNode {
    /// Indices of the next `count` keys the `TEST` client asked for
    pub async fn collect_asked(&mut self, count: usize) -> Vec<u64> {
        let mut seen = Vec::with_capacity(count);
        while seen.len() < count {
            let key = tokio::time::timeout(WAIT, self.asked.recv())
                .await
                .expect("timed out waiting for wanted keys")
                .expect("asked channel closed");
            seen.push(index_of(&key));
        }
        seen
    }

    /// Rendered intervals for `(peer, stream)`, `"[]"` when none are recorded
    pub fn intervals(&self, peer: &NodeId, stream: &Stream) -> String {
        self.registry
            .intervals()
            .get(peer, stream)
            .ok()
            .flatten()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "[]".into())
    }

    /// Store a content-addressed chunk locally
    pub fn put_chunk(&self, data: impl Into<Bytes>) -> ChunkAddress {
        let data = data.into();
        let key = shared_types::chunk_address(&data);
        self.registry.store().put(key, data).expect("chunk put");
        key
    }

    pub fn has(&self, key: &ChunkAddress) -> bool {
        self.registry.store().has(key).unwrap_or(false)
    }
}

/// Options shared by the chunk scenarios. The `TEST` stream serves
/// zero-filled payloads, so it needs `skip_check`.
pub fn chunk_options(skip_check: bool) -> RegistryOptions {
    RegistryOptions {
        syncing: Syncing::RegisterOnly,
        skip_check,
        batch_size: 8,
        batch_timeout_ms: 2_000,
        live_poll_interval_ms: 20,
        retrieve_timeout_ms: 2_000,
        ..RegistryOptions::default()
    }
}

/// A registry whose overlay address starts with `first_byte`, with the
/// `TEST` stream registered on both sides
pub fn chunk_node(first_byte: u8, options: RegistryOptions) -> ChunkNode {
    let mut id = [0u8; 32];
    id[0] = first_byte;
    let id = NodeId::new(id);
    let kv = Arc::new(InMemoryKVStore::new());
    let store: Arc<dyn ChunkStore> =
        Arc::new(KvChunkStore::open(kv.clone(), id).expect("chunk store"));
    let bus = Arc::new(InMemoryEventBus::new());
    let registry =
        Registry::new(options, Arc::clone(&store), kv, bus.clone()).expect("registry");

    let (asked_tx, asked) = mpsc::unbounded_channel();
    registry.register_server_func(
        TEST_KIND,
        Arc::new(|_, _, _| Ok(Arc::new(TestServer) as Arc<dyn Server>)),
    );
    registry.register_client_func(
        TEST_KIND,
        Arc::new(move |_, _, _| {
            Ok(Arc::new(TestClient {
                store: Arc::clone(&store),
                asked: asked_tx.clone(),
            }) as Arc<dyn Client>)
        }),
    );
    ChunkNode {
        id,
        registry,
        bus,
        asked,
    }
}

/// Link two registries with an in-process duplex
pub async fn connect(a: &ChunkNode, b: &ChunkNode) {
    connect_registries(&a.registry, &b.registry).await;
}

pub async fn connect_registries(a: &Arc<Registry>, b: &Arc<Registry>) {
    let (a_end, b_end) = duplex(64);
    a.add_peer(b.local(), a_end).await.expect("add peer");
    b.add_peer(a.local(), b_end).await.expect("add peer");
}
