//! Integration tests for the event relay.
//!
//! - `harness.rs`    - in-memory broker, recording gateway, wait helpers
//! - `handling.rs`   - per-message outcomes (decode, translate, forward)
//! - `ack_policy.rs` - ack / requeue / dead-letter through the supervisor
//! - `ordering.rs`   - FIFO from producer to broker and broker to gateway
//! - `publisher.rs`  - publish retries, drain and shutdown
//! - `reconnect.rs`  - supervisor state machine, backoff, redelivery and claiming
//! - `end_to_end.rs` - full relay against the HTTP gateway client

mod ack_policy;
mod end_to_end;
mod ordering;
