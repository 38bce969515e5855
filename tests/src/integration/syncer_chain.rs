//! # SYNC Replication Along a Chain
//!
//! ```text
//! node0 ── node1 ── node2 ── node3
//!   ◄──────── history pulls, last hop first
//! ```
//!
//! Every node starts with its own chunks. Walking back from the end, each
//! node pulls the full history of every non-empty bin of its right-hand
//! neighbour, so node0 ends up holding everything.

use super::fixtures::*;
use qc_05_chunk_sync::{sync_stream, ClientStatus, Priority, Range, MAX_PO};
use shared_types::ChunkAddress;

const NODES: usize = 4;
const CHUNKS_PER_NODE: usize = 24;

fn seed(node: &ChunkNode, index: usize) -> Vec<ChunkAddress> {
    (0..CHUNKS_PER_NODE)
        .map(|j| node.put_chunk(format!("node {index} chunk {j}").into_bytes()))
        .collect()
}

/// Pull every non-empty bin of `from` into `to`, one bin at a time
async fn pull_all_bins(to: &ChunkNode, from: &ChunkNode) {
    for bin in 0..=MAX_PO {
        let count = from.registry.store().bin_index(bin);
        if count == 0 {
            continue;
        }
        let stream = sync_stream(bin, false);
        let handle = to
            .registry
            .subscribe(from.id, stream.clone(), Some(Range::new(0, 0)), Priority::Mid)
            .await
            .unwrap();
        assert_eq!(
            tokio::time::timeout(WAIT, handle.finished()).await.unwrap(),
            ClientStatus::Done,
            "bin {bin} did not complete"
        );
        assert_eq!(
            to.intervals(&from.id, &stream),
            format!("[[0,{}]]", count - 1),
            "bin {bin}"
        );
    }
}

#[tokio::test]
async fn test_history_sync_replicates_down_the_chain() {
    let nodes: Vec<ChunkNode> = (0..NODES)
        .map(|i| chunk_node(0x10 + (i as u8) * 0x21, chunk_options(false)))
        .collect();
    let mut all_keys = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        all_keys.extend(seed(node, i));
    }
    for pair in nodes.windows(2) {
        connect(&pair[0], &pair[1]).await;
    }

    for i in (0..NODES - 1).rev() {
        pull_all_bins(&nodes[i], &nodes[i + 1]).await;
        let expected = CHUNKS_PER_NODE * (NODES - i);
        let held = all_keys.iter().filter(|key| nodes[i].has(key)).count();
        assert_eq!(held, expected, "node {i}");
    }

    for key in &all_keys {
        assert!(nodes[0].has(key));
    }
    for node in &nodes {
        assert_eq!(
            qc_05_chunk_sync::Metrics::get(&node.registry.metrics().chunk_mismatches),
            0
        );
    }
}

#[tokio::test]
async fn test_live_sync_follows_new_chunks() {
    let upstream = chunk_node(0x80, chunk_options(false));
    let downstream = chunk_node(0x01, chunk_options(false));
    connect(&upstream, &downstream).await;

    // Only chunks falling in bin 0 of the upstream overlay are stored
    let bin = 0;
    let live = sync_stream(bin, true);
    downstream
        .registry
        .subscribe(upstream.id, live.clone(), None, Priority::Mid)
        .await
        .unwrap();
    wait_until("upstream serving", || {
        upstream.registry.is_serving(&downstream.id, &live)
    })
    .await;

    let mut keys = Vec::new();
    let mut j = 0u32;
    while keys.len() < 5 {
        let data = format!("live chunk {j}").into_bytes();
        j += 1;
        let key = shared_types::chunk_address(&data);
        if qc_05_chunk_sync::proximity_bin(&upstream.id, &key) == bin {
            upstream.put_chunk(data);
            keys.push(key);
        }
    }

    wait_until("live chunks replicated", || {
        keys.iter().all(|key| downstream.has(key))
    })
    .await;
}

#[tokio::test]
async fn test_retrieval_is_forwarded_through_a_middle_node() {
    let seeker = chunk_node(0x10, chunk_options(false));
    let middle = chunk_node(0x40, chunk_options(false));
    let holder = chunk_node(0x70, chunk_options(false));
    connect(&seeker, &middle).await;
    connect(&middle, &holder).await;

    let key = holder.put_chunk(b"two hops away".to_vec());
    assert!(!middle.has(&key));

    let data = tokio::time::timeout(WAIT, seeker.registry.request_from_peers(key, None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&data[..], b"two hops away");
    assert!(seeker.has(&key));
    assert!(middle.has(&key));

    // A second request is served from the local store
    let again = seeker
        .registry
        .request_from_peers(key, None)
        .await
        .unwrap();
    assert_eq!(again, data);
}
