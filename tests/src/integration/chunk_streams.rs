//! # Chunk Stream Scenarios
//!
//! Two registries linked in-process, streaming the synthetic `TEST` stream
//! (session at 50, keys up to 100).

use super::fixtures::*;
use qc_05_chunk_sync::{ClientStatus, Priority, Range, Stream};

async fn pair() -> (ChunkNode, ChunkNode) {
    let server = chunk_node(0x10, chunk_options(true));
    let client = chunk_node(0x20, chunk_options(true));
    connect(&server, &client).await;
    (server, client)
}

// =============================================================================
// History, live, and both
// =============================================================================

#[tokio::test]
async fn test_history_range_is_fetched_exactly() {
    let (server, mut client) = pair().await;
    let stream = Stream::new(TEST_KIND, "", false);

    let handle = client
        .registry
        .subscribe(server.id, stream.clone(), Some(Range::new(9, 26)), Priority::Mid)
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, handle.finished()).await.unwrap(),
        ClientStatus::Done
    );

    assert_eq!(client.collect_asked(18).await, (9..=26).collect::<Vec<_>>());
    assert_eq!(client.intervals(&server.id, &stream), "[[9,26]]");
    assert!((9..=26).all(|i| client.has(&test_key(i))));
    assert!(!client.has(&test_key(8)));
    assert!(!client.has(&test_key(27)));
}

#[tokio::test]
async fn test_live_stream_starts_at_session() {
    let (server, mut client) = pair().await;
    let stream = Stream::new(TEST_KIND, "", true);

    client
        .registry
        .subscribe(server.id, stream.clone(), None, Priority::Mid)
        .await
        .unwrap();

    assert_eq!(client.collect_asked(51).await, (50..=100).collect::<Vec<_>>());
    wait_until("live intervals", || {
        client.intervals(&server.id, &stream) == "[[50,100]]"
    })
    .await;
    assert!(!client.has(&test_key(49)));
}

#[tokio::test]
async fn test_live_with_history_range() {
    let (server, mut client) = pair().await;
    let live = Stream::new(TEST_KIND, "", true);

    client
        .registry
        .subscribe(server.id, live.clone(), Some(Range::new(9, 26)), Priority::High)
        .await
        .unwrap();

    let mut asked = client.collect_asked(18 + 51).await;
    asked.sort_unstable();
    assert_eq!(asked, (9..=26).chain(50..=100).collect::<Vec<_>>());

    wait_until("both directions recorded", || {
        client.intervals(&server.id, &live.history()) == "[[9,26]]"
            && client.intervals(&server.id, &live) == "[[50,100]]"
    })
    .await;
    assert!(client.registry.client(&server.id, &live).is_some());
}

// =============================================================================
// Resumption
// =============================================================================

#[tokio::test]
async fn test_second_subscription_resumes_after_first() {
    let (server, mut client) = pair().await;
    let stream = Stream::new(TEST_KIND, "", false);

    let first = client
        .registry
        .subscribe(server.id, stream.clone(), Some(Range::new(9, 14)), Priority::Mid)
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, first.finished()).await.unwrap(),
        ClientStatus::Done
    );
    assert_eq!(client.collect_asked(6).await, (9..=14).collect::<Vec<_>>());
    assert_eq!(client.intervals(&server.id, &stream), "[[9,14]]");
    wait_until("first client released", || {
        client.registry.client(&server.id, &stream).is_none()
    })
    .await;

    let second = client
        .registry
        .subscribe(server.id, stream.clone(), Some(Range::new(9, 26)), Priority::Mid)
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, second.finished()).await.unwrap(),
        ClientStatus::Done
    );
    assert_eq!(client.collect_asked(12).await, (15..=26).collect::<Vec<_>>());
    assert!(client.asked.try_recv().is_err());
    assert_eq!(client.intervals(&server.id, &stream), "[[9,26]]");
}

#[tokio::test]
async fn test_resubscribe_after_unsubscribe_picks_up_the_gap() {
    let (server, mut client) = pair().await;
    let live = Stream::new(TEST_KIND, "", true);

    let first = client
        .registry
        .subscribe(server.id, live.clone(), None, Priority::Mid)
        .await
        .unwrap();
    assert_eq!(client.collect_asked(51).await, (50..=100).collect::<Vec<_>>());
    wait_until("live intervals", || {
        client.intervals(&server.id, &live) == "[[50,100]]"
    })
    .await;

    client.registry.unsubscribe(server.id, &live).await.unwrap();
    let second = client
        .registry
        .subscribe(server.id, live.clone(), Some(Range::new(9, 26)), Priority::Mid)
        .await
        .unwrap();
    assert!(second.is_running());
    assert_eq!(
        tokio::time::timeout(WAIT, first.finished()).await.unwrap(),
        ClientStatus::Done
    );

    // Live keys are recorded, so only the requested history is fetched
    assert_eq!(client.collect_asked(18).await, (9..=26).collect::<Vec<_>>());
    wait_until("history recorded", || {
        client.intervals(&server.id, &live.history()) == "[[9,26]]"
    })
    .await;
    wait_until("live served again", || {
        server.registry.is_serving(&client.id, &live)
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(client.asked.try_recv().is_err());
    assert_eq!(client.intervals(&server.id, &live), "[[50,100]]");
    assert!(client.registry.client(&server.id, &live).unwrap().is_running());
}

#[tokio::test]
async fn test_held_chunks_are_not_wanted_again() {
    let (server, mut client) = pair().await;
    let stream = Stream::new(TEST_KIND, "", false);

    // A chunk already stored locally is skipped even though its index is new
    client
        .registry
        .store()
        .put(test_key(12), bytes::Bytes::from(vec![0u8; 4096]))
        .unwrap();

    let handle = client
        .registry
        .subscribe(server.id, stream.clone(), Some(Range::new(9, 14)), Priority::Mid)
        .await
        .unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, handle.finished()).await.unwrap(),
        ClientStatus::Done
    );
    assert_eq!(client.collect_asked(5).await, vec![9, 10, 11, 13, 14]);
    assert!(client.asked.try_recv().is_err());
    assert_eq!(client.intervals(&server.id, &stream), "[[9,14]]");
}

#[tokio::test]
async fn test_history_at_or_above_session_yields_nothing() {
    let (server, mut client) = pair().await;
    let stream = Stream::new(TEST_KIND, "", false);

    let handle = client
        .registry
        .subscribe(server.id, stream.clone(), Some(Range::new(60, 70)), Priority::Mid)
        .await
        .unwrap();
    let status = tokio::time::timeout(WAIT, handle.finished()).await.unwrap();
    assert_ne!(status, ClientStatus::Running);
    assert!(client.asked.try_recv().is_err());
    assert!(!client.has(&test_key(60)));
}
