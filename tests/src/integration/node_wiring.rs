//! # Node Runtime Wiring
//!
//! Two node-runtime containers, each bootstrapping its own single-member
//! raft cluster, with their chunk-sync registries linked in-process.

use std::sync::Arc;

use node_runtime::{GenesisAccount, NodeConfig, SubsystemContainer};
use qc_17_raft_minter::ports::TxPool;
use qc_05_chunk_sync::{proximity_bin, sync_stream, ClientStatus, Priority, Range, Syncing};
use shared_bus::{BlockchainEvent, EventFilter, EventTopic};
use shared_types::{InMemoryKVStore, KeyValueStore};

use super::fixtures::*;

fn config(raft_id: u64, syncing: Syncing) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.raft.raft.raft_id = raft_id;
    config.raft.minter.minter_id = raft_id;
    config.raft.minter.block_time_ms = 20;
    config.sync = chunk_options(false);
    config.sync.syncing = syncing;
    config.node.genesis = vec![GenesisAccount {
        address: hex::encode(ALICE),
        balance: 1_000_000,
    }];
    config.validate().expect("valid config");
    config
}

fn container(raft_id: u64, syncing: Syncing) -> SubsystemContainer {
    SubsystemContainer::with_store(config(raft_id, syncing), Arc::new(InMemoryKVStore::new()))
        .expect("container")
}

#[tokio::test]
async fn test_container_mints_from_its_pool() {
    let node = container(1, Syncing::RegisterOnly);
    let mut heads = node
        .event_bus
        .subscribe(EventFilter::topics(vec![EventTopic::Chain]));
    node.raft.start().unwrap();

    node.pool.add(transfer(0, 0xB0));
    let minter = tokio::time::timeout(WAIT, async {
        loop {
            match heads.recv().await {
                Some(BlockchainEvent::NewHead { head, minter_id, .. }) if head.height == 1 => {
                    return minter_id
                }
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("no head published");
    assert_eq!(minter, 1);
    wait_until("pool drained", || node.pool.is_empty()).await;

    node.registry.close().await;
    node.raft.stop().await;
    node.kv.flush().unwrap();
}

#[tokio::test]
async fn test_two_nodes_sync_chunks_over_their_registries() {
    let a = container(1, Syncing::RegisterOnly);
    let b = container(2, Syncing::RegisterOnly);
    assert_ne!(a.registry.local(), b.registry.local());

    let data = b"stored on node a".to_vec();
    let key = shared_types::chunk_address(&data);
    a.registry.store().put(key, data.into()).unwrap();
    let bin = proximity_bin(&a.registry.local(), &key);

    connect_registries(&a.registry, &b.registry).await;
    let stream = sync_stream(bin, false);
    let handle = b
        .registry
        .subscribe(a.registry.local(), stream.clone(), Some(Range::new(0, 0)), Priority::Mid)
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, handle.finished()).await.unwrap(),
        ClientStatus::Done
    );
    assert!(b.registry.store().has(&key).unwrap());

    // Chunks and intervals live in the node's key-value store
    let recorded = b
        .registry
        .intervals()
        .get(&a.registry.local(), &stream)
        .unwrap()
        .unwrap();
    assert_eq!(recorded.to_string(), "[[0,0]]");
    assert!(!b.kv.prefix_scan(b"").unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_subscribe_follows_a_new_peer() {
    let a = container(1, Syncing::RegisterOnly);
    let b = container(2, Syncing::AutoSubscribe);
    connect_registries(&a.registry, &b.registry).await;

    let bin = proximity_bin(&b.registry.local(), a.registry.local().as_bytes());
    let live = sync_stream(bin, true);
    assert!(b.registry.client(&a.registry.local(), &live).is_some());
    wait_until("a serving b's live bin", || {
        a.registry.is_serving(&b.registry.local(), &live)
    })
    .await;

    b.registry.close().await;
    wait_until("a notices b leaving", || {
        !a.registry.is_connected(&b.registry.local())
    })
    .await;
}
