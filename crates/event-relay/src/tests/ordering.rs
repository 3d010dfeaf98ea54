//! Ordering tests.
//!
//! Behaviors covered:
//! - one producer's events reach the broker in call order
//! - concurrent producers each keep their own order
//! - the consumer forwards in queue order, one message at a time

use super::harness::{test_config, wait_until, GatewayReply, MemoryBroker, RecordingGateway, QUEUE};
use crate::publisher::Publisher;
use crate::relay::Relay;
use crate::stats::RelayStats;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

fn team_id(query: &str) -> u64 {
    let start = query.find("team_id: ").unwrap() + "team_id: ".len();
    query[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap()
}

/// A hundred events from one caller are published in call order.
#[tokio::test(start_paused = true)]
async fn single_producer_is_fifo() {
    let broker = MemoryBroker::new();
    let stats = Arc::new(RelayStats::default());
    let publisher = Publisher::start(Arc::new(broker.clone()), QUEUE, test_config().publisher, stats);

    let handle = publisher.handle();
    for seq in 0..100u64 {
        assert!(handle.publish_event("team_created", json!({ "seq": seq })).unwrap());
    }

    assert!(wait_until(WAIT, || broker.published().len() == 100).await);

    let seqs: Vec<u64> = broker
        .published()
        .iter()
        .map(|r| r.envelope().payload["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>());

    publisher.shutdown().await.unwrap();
}

/// Interleaving between producers is free, but each producer's own
/// sequence is preserved.
#[tokio::test(start_paused = true)]
async fn concurrent_producers_keep_their_order() {
    let broker = MemoryBroker::new();
    let stats = Arc::new(RelayStats::default());
    let publisher = Publisher::start(Arc::new(broker.clone()), QUEUE, test_config().publisher, stats);

    let mut producers = Vec::new();
    for producer in 0..4u64 {
        let handle = publisher.handle();
        producers.push(tokio::spawn(async move {
            for seq in 0..25u64 {
                handle
                    .publish_event("team_created", json!({ "producer": producer, "seq": seq }))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert!(wait_until(WAIT, || broker.published().len() == 100).await);

    let published = broker.published();
    for producer in 0..4u64 {
        let seqs: Vec<u64> = published
            .iter()
            .map(|r| r.envelope())
            .filter(|e| e.payload["producer"] == json!(producer))
            .map(|e| e.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }

    publisher.shutdown().await.unwrap();
}

/// Queued messages reach the gateway in queue order, and the next one is
/// not started before the previous one finished.
#[tokio::test(start_paused = true)]
async fn consumer_forwards_in_order_one_at_a_time() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    gateway.set_default_reply(GatewayReply::Delay(Duration::from_millis(100)));

    for id in 1..=5u64 {
        broker.push_event(QUEUE, "team_created", json!({ "team_id": id, "team_name": format!("Team{id}") }));
    }

    let started = Instant::now();
    let relay = Relay::start(test_config(), Arc::new(broker.clone()), gateway.clone());
    assert!(wait_until(WAIT, || broker.acks().len() == 5).await);

    assert!(started.elapsed() >= Duration::from_millis(500));

    let ids: Vec<u64> = gateway.requests().iter().map(|r| team_id(&r.query)).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(broker.pending_count(), 0);

    relay.shutdown().await.unwrap();
}

/// Events published through the relay come out of its consumer in order.
#[tokio::test(start_paused = true)]
async fn relay_round_trip_preserves_order() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    let relay = Relay::start(test_config(), Arc::new(broker.clone()), gateway.clone());

    let publisher = relay.publisher();
    for id in 1..=10u64 {
        publisher
            .publish_event("team_created", json!({ "team_id": id, "team_name": "T" }))
            .unwrap();
    }

    assert!(wait_until(WAIT, || broker.acks().len() == 10).await);

    let ids: Vec<u64> = gateway.requests().iter().map(|r| team_id(&r.query)).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.published, 10);
    assert_eq!(snap.processed, 10);
    assert_eq!(snap.gateway_calls, 10);
}
