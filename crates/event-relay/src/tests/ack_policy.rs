//! Acknowledgment discipline tests, run through a full relay.
//!
//! Behaviors covered:
//! - ack-always settles every delivery with an ack, including failures
//! - retry-then-dead-letter requeues transient failures up to the limit
//! - permanent rejections are never retried
//! - a poison message does not block the queue

use super::harness::{test_config, wait_until, GatewayReply, MemoryBroker, RecordingGateway, QUEUE};
use crate::delivery::AckPolicy;
use crate::gateway::GatewayError;
use crate::relay::Relay;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn start(broker: &MemoryBroker, gateway: &Arc<RecordingGateway>, policy: AckPolicy) -> Relay {
    let mut config = test_config();
    config.ack_policy = policy;
    Relay::start(config, Arc::new(broker.clone()), gateway.clone())
}

fn team_created(broker: &MemoryBroker) -> String {
    broker.push_event(QUEUE, "team_created", json!({ "team_id": 1, "team_name": "Team1" }))
}

/// Under ack-always a transient failure is acknowledged and not retried.
#[tokio::test(start_paused = true)]
async fn ack_always_acks_transient_failure() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    gateway.set_default_reply(GatewayReply::Fail(GatewayError::Transport("refused".into())));
    let id = team_created(&broker);

    let relay = start(&broker, &gateway, AckPolicy::AckAlways);
    assert!(wait_until(WAIT, || broker.settled_count() == 1).await);

    // Give a wrongly requeued copy time to come back.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(broker.acks(), vec![id]);
    assert!(broker.requeues().is_empty());
    assert!(broker.dead_letters().is_empty());
    assert_eq!(gateway.request_count(), 1);

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.rejected_transient, 1);
    assert_eq!(snap.requeued, 0);
}

/// A message failing transiently every time is tried `max_attempts` times
/// and then parked in the dead-letter queue.
#[tokio::test(start_paused = true)]
async fn retries_then_dead_letters() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    gateway.set_default_reply(GatewayReply::Fail(GatewayError::Status {
        status: 503,
        body: "unavailable".into(),
    }));
    team_created(&broker);

    let relay = start(&broker, &gateway, AckPolicy::RetryThenDeadLetter { max_attempts: 3 });
    assert!(wait_until(WAIT, || broker.dead_letters().len() == 1).await);

    assert_eq!(gateway.request_count(), 3);
    assert_eq!(broker.requeues().len(), 2);
    assert!(broker.acks().is_empty());
    assert!(broker.queued(QUEUE).is_empty());

    let parked = broker.queued(&format!("{QUEUE}.dead-letter"));
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempts, 3);

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.requeued, 2);
    assert_eq!(snap.dead_lettered, 1);
    assert_eq!(snap.rejected_transient, 3);
}

/// A transient failure followed by success is requeued once, then acked.
#[tokio::test(start_paused = true)]
async fn retry_succeeds_before_limit() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    gateway.queue_reply(GatewayReply::Fail(GatewayError::Timeout(Duration::from_secs(10))));
    team_created(&broker);

    let relay = start(&broker, &gateway, AckPolicy::RetryThenDeadLetter { max_attempts: 3 });
    assert!(wait_until(WAIT, || broker.acks().len() == 1).await);

    assert_eq!(gateway.request_count(), 2);
    assert_eq!(broker.requeues().len(), 1);
    assert!(broker.dead_letters().is_empty());

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.processed, 1);
    assert_eq!(snap.rejected_transient, 1);
}

/// Permanent rejections are acknowledged even under the retry policy.
#[tokio::test(start_paused = true)]
async fn permanent_rejection_is_acked() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    broker.push_event(QUEUE, "player_created", json!({ "player_id": 1 }));
    gateway.queue_reply(GatewayReply::Fail(GatewayError::Status {
        status: 400,
        body: "bad request".into(),
    }));
    team_created(&broker);

    let relay = start(&broker, &gateway, AckPolicy::RetryThenDeadLetter { max_attempts: 3 });
    assert!(wait_until(WAIT, || broker.acks().len() == 2).await);

    assert!(broker.requeues().is_empty());
    assert!(broker.dead_letters().is_empty());
    assert_eq!(gateway.request_count(), 1);

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.rejected_permanent, 1);
    assert_eq!(snap.processed, 1);
}

/// A malformed body is acknowledged and the next message still flows.
#[tokio::test(start_paused = true)]
async fn poison_message_does_not_block_queue() {
    let broker = MemoryBroker::new();
    let gateway = Arc::new(RecordingGateway::new());
    let poison = broker.push_raw(QUEUE, b"{ this is not json");
    let good = team_created(&broker);

    let relay = start(&broker, &gateway, AckPolicy::AckAlways);
    assert!(wait_until(WAIT, || broker.acks().len() == 2).await);

    assert_eq!(broker.acks(), vec![poison, good]);
    assert_eq!(gateway.request_count(), 1);
    assert_eq!(broker.pending_count(), 0);

    relay.shutdown().await.unwrap();
}
