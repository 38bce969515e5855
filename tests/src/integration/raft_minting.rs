//! # Raft Minting Scenarios
//!
//! Three minters share one in-process raft log. Node 1 starts as leader.

use super::fixtures::*;
use qc_17_raft_minter::ports::TxPool;
use qc_17_raft_minter::RaftRole;
use shared_bus::{BlockchainEvent, EventFilter, EventTopic};
use shared_types::Hash;

fn heads_agree(nodes: &[RaftNode], height: u64) -> bool {
    let first = nodes[0].service.head();
    first.height == height && nodes.iter().all(|node| node.service.head() == first)
}

// =============================================================================
// Steady leader
// =============================================================================

#[tokio::test]
async fn test_leader_mints_and_every_node_applies_in_order() {
    let (_cluster, nodes) = raft_cluster(&[1, 2, 3]);
    wait_until("node 1 minting", || nodes[0].service.role() == RaftRole::Minter).await;
    assert_eq!(nodes[1].service.role(), RaftRole::Verifier);

    let txs: Vec<_> = (0..10).map(|nonce| transfer(nonce, 0xB0)).collect();
    let submitted: Vec<Hash> = txs.iter().map(|tx| tx.hash()).collect();
    for tx in txs {
        assert!(nodes[0].pool.add(tx));
    }

    wait_until("all ten transactions applied everywhere", || {
        nodes.iter().all(|node| node.chain_tx_hashes().len() == 10)
    })
    .await;
    let height = nodes[0].service.head().height;
    assert!(heads_agree(&nodes, height));

    for node in &nodes {
        assert_eq!(node.chain_tx_hashes(), submitted, "node {}", node.id);
        for h in 1..=height {
            let block = node.block_at(h).unwrap();
            assert_eq!(block.minter_id, 1);
            assert_eq!(Some(block.parent_hash), node.hash_at(h - 1));
        }
    }
    assert!(nodes[0].pool.is_empty());
}

#[tokio::test]
async fn test_verifiers_publish_new_heads() {
    let (_cluster, nodes) = raft_cluster(&[1, 2]);
    let mut heads = nodes[1]
        .bus
        .subscribe(EventFilter::topics(vec![EventTopic::Chain]));

    nodes[0].pool.add(transfer(0, 0xB1));
    let event = tokio::time::timeout(WAIT, async {
        loop {
            match heads.recv().await {
                Some(BlockchainEvent::NewHead { head, tx_count, minter_id }) => {
                    return (head, tx_count, minter_id)
                }
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("no NewHead on the verifier");
    assert_eq!(event.0.height, 1);
    assert_eq!(event.1, 1);
    assert_eq!(event.2, 1);
}

// =============================================================================
// Leader change with a rival block
// =============================================================================

#[tokio::test]
async fn test_partitioned_leader_block_is_dropped_after_new_election() {
    let (cluster, nodes) = raft_cluster(&[1, 2, 3]);

    for nonce in 0..4 {
        nodes[0].pool.add(transfer(nonce, 0xB0));
        wait_until("height reached everywhere", || heads_agree(&nodes, nonce + 1)).await;
    }

    // Node 1 mints while cut off; the proposal cannot commit
    cluster.partition(1);
    let rival = transfer(4, 0xC1);
    nodes[0].pool.add(rival.clone());
    wait_until("rival proposal pending", || cluster.pending_len() >= 1).await;

    cluster.elect(2);
    wait_until("node 2 minting", || nodes[1].service.role() == RaftRole::Minter).await;
    let winner = transfer(4, 0xC2);
    nodes[1].pool.add(winner.clone());
    wait_until("node 2 at height 5", || nodes[1].service.head().height == 5).await;

    cluster.heal(1);
    wait_until("node 1 converges", || {
        nodes[0].service.head() == nodes[1].service.head()
    })
    .await;
    wait_until("node 3 converges", || {
        nodes[2].service.head() == nodes[1].service.head()
    })
    .await;
    assert_eq!(cluster.pending_len(), 0);

    let fifth = nodes[0].block_at(5).unwrap();
    assert_eq!(nodes[0].hash_at(5), nodes[1].hash_at(5));
    assert_eq!(fifth.minter_id, 2);
    assert_eq!(fifth.tx_hashes(), vec![winner.hash()]);
    assert!(!nodes[0].chain_tx_hashes().contains(&rival.hash()));
    assert_eq!(nodes[0].service.role(), RaftRole::Verifier);
    assert_eq!(nodes[0].service.leader(), Some(2));

    // Nothing of the cut-off block survives in node 1's speculative chain
    let head = nodes[1].service.head().block_hash;
    wait_until("node 1 speculative chain re-rooted", || {
        let chain = nodes[0].service.minter().speculative_chain();
        chain.is_empty() && chain.root_hash() == head
    })
    .await;
    let chain = nodes[0].service.minter().speculative_chain();
    assert!(!chain.proposed_tx_hashes().contains(&rival.hash()));
    assert!(chain.pending_hashes().is_empty());
}
