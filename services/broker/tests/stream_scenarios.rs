//! Streaming-path scenarios: publish, tail, batching, boundary offsets
//! and session lifecycle against a live broker.

mod common;

use common::{boot, boot_with, node_id, wait_for_last_offset};
use quiver_coordination::Coordination;
use quiver_wire::{ErrorCode, FetchRequest, Message, PutRecord, SessionType};
use std::collections::HashSet;
use std::time::Duration;

fn record(fragment: u32, data: &[u8]) -> PutRecord {
    PutRecord {
        fragment,
        node_id: node_id(),
        data: bytes::Bytes::copy_from_slice(data),
    }
}

fn items_of(message: Message) -> (Vec<(u32, u64, Vec<u8>)>, u64) {
    match message {
        Message::FetchResponse { items, last_offset } => (
            items
                .into_iter()
                .map(|item| (item.fragment, item.seq, item.data.to_vec()))
                .collect(),
            last_offset,
        ),
        other => panic!("expected FetchResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn pub_sub_single_fragment_delivers_in_order() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    let offsets = publisher
        .put(vec![record(0, b"a"), record(0, b"b"), record(0, b"c")])
        .await;
    assert_eq!(
        offsets.iter().map(|offset| offset.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;
    subscriber.fetch(0, 1, 1).await;

    for (seq, expected) in [(1u64, b"a"), (2, b"b"), (3, b"c")] {
        let (items, _) = items_of(subscriber.recv().await.expect("fetch response"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1, seq);
        assert_eq!(items[0].2, expected.to_vec());
    }

    // The durable counter catches up within one flush interval.
    let observed =
        wait_for_last_offset(&broker.coordination, "t1", 0, 3, Duration::from_secs(2)).await;
    assert_eq!(observed, 3);
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn blocked_tail_wakes_on_publish() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;
    subscriber.fetch(0, 1, 1).await;

    // Empty topic: the fetch must block, not error.
    assert!(
        subscriber
            .try_recv(Duration::from_millis(500))
            .await
            .is_none()
    );

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    publisher.put(vec![record(0, b"x")]).await;

    let woken = subscriber
        .try_recv(Duration::from_millis(200))
        .await
        .expect("wakeup delivery");
    let (items, _) = items_of(woken);
    assert_eq!(items[0].1, 1);
    assert_eq!(items[0].2, b"x".to_vec());
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn batched_fetch_flushes_on_batch_size() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    let records = (0..10u8).map(|i| record(0, &[b'r', i])).collect();
    publisher.put(records).await;

    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;
    subscriber
        .send(&Message::FetchRequest(FetchRequest {
            fragment: 0,
            start_offset: 1,
            batch_size: 5,
            flush_interval_ms: 100,
        }))
        .await;

    let (first, _) = items_of(subscriber.recv().await.expect("first batch"));
    let (second, _) = items_of(subscriber.recv().await.expect("second batch"));
    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    assert_eq!(
        first
            .iter()
            .chain(second.iter())
            .map(|(_, seq, _)| *seq)
            .collect::<Vec<_>>(),
        (1..=10u64).collect::<Vec<_>>()
    );
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn multi_fragment_subscribers_partition_the_stream() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t2", 3).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t2", vec![0, 1, 2])
        .await;
    let mut published: HashSet<Vec<u8>> = HashSet::new();
    for i in 0..30u8 {
        let data = vec![b'm', i];
        published.insert(data.clone());
        publisher.put(vec![record(u32::from(i) % 3, &data)]).await;
    }

    let mut received: HashSet<Vec<u8>> = HashSet::new();
    for fragment in 0..3u32 {
        let mut subscriber = broker.client().await;
        subscriber
            .connect_session(SessionType::Subscriber, "t2", vec![fragment])
            .await;
        subscriber.fetch(fragment, 1, 1).await;
        for _ in 0..10 {
            let (items, _) = items_of(subscriber.recv().await.expect("item"));
            assert_eq!(items[0].0, fragment);
            received.insert(items[0].2.clone());
        }
    }

    assert_eq!(received, published);
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn fetch_beyond_tail_plus_one_errors_and_closes() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    publisher
        .put(vec![record(0, b"a"), record(0, b"b"), record(0, b"c")])
        .await;

    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;
    subscriber.fetch(0, 10, 1).await;
    subscriber.expect_error_ack(ErrorCode::InvalidStartOffset).await;
    // InvalidStartOffset is session-closeable: expect a FIN next.
    assert!(subscriber.recv().await.is_none());
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn fetch_at_tail_plus_one_blocks_until_publish() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    publisher
        .put(vec![record(0, b"a"), record(0, b"b"), record(0, b"c")])
        .await;

    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;
    // start_offset == last + 1 must block, not error.
    subscriber.fetch(0, 4, 1).await;
    assert!(
        subscriber
            .try_recv(Duration::from_millis(300))
            .await
            .is_none()
    );

    publisher.put(vec![record(0, b"d")]).await;
    let (items, _) = items_of(
        subscriber
            .try_recv(Duration::from_millis(500))
            .await
            .expect("tail delivery"),
    );
    assert_eq!(items[0].1, 4);
    assert_eq!(items[0].2, b"d".to_vec());
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn put_after_topic_deletion_acks_not_exists() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    publisher.put(vec![record(0, b"a")]).await;

    let deleted = admin
        .request(&Message::DeleteTopicRequest {
            name: "t1".to_string(),
        })
        .await;
    assert_eq!(deleted, Message::DeleteTopicResponse {});

    publisher.send(&Message::PutRequest {
        records: vec![record(0, b"b")],
    })
    .await;
    publisher.expect_error_ack(ErrorCode::TopicNotExists).await;
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn connect_to_missing_topic_acks_and_closes() {
    let broker = boot().await;
    let mut client = broker.client().await;
    client
        .send(&Message::ConnectRequest(quiver_wire::ConnectRequest {
            session_type: SessionType::Subscriber,
            topic: "missing".to_string(),
            fragment_ids: vec![0],
        }))
        .await;
    client.expect_error_ack(ErrorCode::TopicNotExists).await;
    assert!(client.recv().await.is_none());
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn fetch_before_connect_is_not_connected() {
    let broker = boot().await;
    let mut client = broker.client().await;
    client
        .send(&Message::FetchRequest(FetchRequest {
            fragment: 0,
            start_offset: 1,
            batch_size: 1,
            flush_interval_ms: 0,
        }))
        .await;
    client.expect_error_ack(ErrorCode::NotConnected).await;
    assert!(client.recv().await.is_none());
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn publisher_cannot_fetch() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 1).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0])
        .await;
    publisher
        .send(&Message::FetchRequest(FetchRequest {
            fragment: 0,
            start_offset: 1,
            batch_size: 1,
            flush_interval_ms: 0,
        }))
        .await;
    publisher.expect_error_ack(ErrorCode::InvalidStateForOp).await;
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn counters_decrement_when_sessions_disconnect() {
    let broker = boot().await;
    let mut admin = broker.client().await;
    admin.create_topic("t1", 2).await;

    let mut publisher = broker.client().await;
    publisher
        .connect_session(SessionType::Publisher, "t1", vec![0, 1])
        .await;
    let mut subscriber = broker.client().await;
    subscriber
        .connect_session(SessionType::Subscriber, "t1", vec![0])
        .await;

    let fragment0 = broker.coordination.fragment_data("t1", 0).await.expect("data");
    assert_eq!(fragment0.num_publishers, 1);
    assert_eq!(fragment0.num_subscribers, 1);
    let fragment1 = broker.coordination.fragment_data("t1", 1).await.expect("data");
    assert_eq!(fragment1.num_publishers, 1);
    assert_eq!(fragment1.num_subscribers, 0);

    drop(publisher);
    drop(subscriber);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let fragment0 = broker.coordination.fragment_data("t1", 0).await.expect("data");
        let fragment1 = broker.coordination.fragment_data("t1", 1).await.expect("data");
        let drained = fragment0.num_publishers == 0
            && fragment0.num_subscribers == 0
            && fragment1.num_publishers == 0;
        if drained {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "counters were not decremented"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    broker.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn idle_session_is_closed_after_read_timeout() {
    let broker = boot_with(|config| config.session_read_timeout_ms = 200).await;
    let mut client = broker.client().await;
    // No frame is ever sent; the broker FINs us after the deadline, well
    // inside the harness receive timeout.
    assert!(client.recv().await.is_none());
    broker.handle.shutdown().await.expect("shutdown");
}
