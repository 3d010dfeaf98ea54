//! End-to-end tests against an HTTP gateway.
//!
//! Behaviors covered:
//! - a published event becomes exactly one mutation POST with its values
//! - unrecognized kinds never produce an HTTP request
//! - server errors are retried and finally dead-lettered

use super::harness::{test_config, wait_until, MemoryBroker, QUEUE};
use crate::delivery::AckPolicy;
use crate::gateway::HttpGateway;
use crate::relay::Relay;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

fn start(broker: &MemoryBroker, server: &MockServer, policy: AckPolicy) -> Relay {
    let mut config = test_config();
    config.gateway.url = format!("{}/graphql", server.uri());
    config.gateway.timeout = Duration::from_secs(2);
    config.ack_policy = policy;

    let gateway = Arc::new(HttpGateway::new(config.gateway.clone()).unwrap());
    Relay::start(config, Arc::new(broker.clone()), gateway)
}

/// `team_created` is forwarded as one `create_team` mutation.
#[tokio::test]
async fn team_created_reaches_gateway() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "create_team": { "team_id": 1, "team_name": "Team1" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let broker = MemoryBroker::new();
    let relay = start(&broker, &server, AckPolicy::AckAlways);

    assert!(relay
        .publisher()
        .publish_event("team_created", json!({ "team_id": 1, "team_name": "Team1" }))
        .unwrap());

    assert!(wait_until(WAIT, || broker.acks().len() == 1).await);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = requests[0].body_json().unwrap();
    let query = body["query"].as_str().unwrap();
    assert!(query.starts_with("mutation { create_team("));
    assert!(query.contains("team_id: 1"));
    assert!(query.contains(r#"team_name: "Team1""#));

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.published, 1);
    assert_eq!(snap.processed, 1);
    server.verify().await;
}

/// An unrecognized kind is consumed and acknowledged without any request.
#[tokio::test]
async fn unrecognized_kind_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let broker = MemoryBroker::new();
    let relay = start(&broker, &server, AckPolicy::AckAlways);

    relay
        .publisher()
        .publish_event("audit_log", json!({ "actor": "admin", "action": "login" }))
        .unwrap();

    assert!(wait_until(WAIT, || broker.acks().len() == 1).await);
    assert!(broker.queued(QUEUE).is_empty());

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.processed, 1);
    assert_eq!(snap.gateway_calls, 0);
    server.verify().await;
}

/// A gateway answering 503 is retried until the attempt limit, then the
/// message is parked in the dead-letter queue.
#[tokio::test]
async fn server_errors_end_in_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/graphql"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(2)
        .mount(&server)
        .await;

    let broker = MemoryBroker::new();
    broker.push_event(QUEUE, "team_joined", json!({ "team_id": 4, "team_name": "Reds" }));
    let relay = start(&broker, &server, AckPolicy::RetryThenDeadLetter { max_attempts: 2 });

    assert!(wait_until(WAIT, || broker.dead_letters().len() == 1).await);

    assert_eq!(broker.requeues().len(), 1);
    assert!(broker.acks().is_empty());
    assert_eq!(broker.queued(&format!("{QUEUE}.dead-letter")).len(), 1);

    let snap = relay.shutdown().await.unwrap();
    assert_eq!(snap.rejected_transient, 2);
    assert_eq!(snap.dead_lettered, 1);
    server.verify().await;
}
