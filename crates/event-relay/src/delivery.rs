//! Per-message handling and the acknowledgment policy.
//!
//! Every delivery ends in exactly one [`DeliveryOutcome`], which the
//! [`AckPolicy`] turns into exactly one [`Disposition`]. Nothing raised
//! while handling a message escapes [`DeliveryHandler::handle`].

use crate::broker::Delivery;
use crate::dispatcher::Dispatcher;
use crate::envelope::EventEnvelope;
use crate::error::{RelayError, RelayResult};
use crate::gateway::Gateway;
use crate::stats::RelayStats;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled, including unrecognized kinds
    Processed,
    /// May succeed if retried (gateway unreachable, 5xx)
    RejectedTransient,
    /// Will never succeed (malformed body, missing fields)
    RejectedPermanent,
}

/// What the supervisor tells the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// How outcomes map to dispositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge every delivery whatever the outcome.
    #[default]
    AckAlways,

    /// Requeue transient rejections until `max_attempts` handling attempts
    /// have been made, then move the message to the dead-letter queue.
    RetryThenDeadLetter { max_attempts: u32 },
}

impl AckPolicy {
    /// Parse a policy name (`ack-always` or `retry-then-dead-letter`).
    pub fn parse(name: &str, max_attempts: u32) -> RelayResult<Self> {
        match name.trim() {
            "ack-always" => Ok(AckPolicy::AckAlways),
            "retry-then-dead-letter" => {
                if max_attempts == 0 {
                    return Err(RelayError::Config(
                        "RELAY_MAX_ATTEMPTS must be at least 1".to_string(),
                    ));
                }
                Ok(AckPolicy::RetryThenDeadLetter { max_attempts })
            }
            other => Err(RelayError::Config(format!("unknown ack policy {other:?}"))),
        }
    }

    /// Decide the disposition of a delivery that has already been
    /// attempted `attempts` times before this one.
    pub fn resolve(&self, outcome: DeliveryOutcome, attempts: u32) -> Disposition {
        match (self, outcome) {
            (AckPolicy::AckAlways, _) => Disposition::Ack,
            (AckPolicy::RetryThenDeadLetter { .. }, DeliveryOutcome::Processed)
            | (AckPolicy::RetryThenDeadLetter { .. }, DeliveryOutcome::RejectedPermanent) => {
                Disposition::Ack
            }
            (AckPolicy::RetryThenDeadLetter { max_attempts }, DeliveryOutcome::RejectedTransient) => {
                if attempts.saturating_add(1) >= *max_attempts {
                    Disposition::DeadLetter
                } else {
                    Disposition::Requeue
                }
            }
        }
    }
}

/// Decodes, translates and forwards one delivery at a time.
pub struct DeliveryHandler<G> {
    dispatcher: Dispatcher,
    gateway: Arc<G>,
    stats: Arc<RelayStats>,
}

impl<G: Gateway> DeliveryHandler<G> {
    pub fn new(dispatcher: Dispatcher, gateway: Arc<G>, stats: Arc<RelayStats>) -> Self {
        Self {
            dispatcher,
            gateway,
            stats,
        }
    }

    /// Handle one delivery. Never fails and never panics outward.
    pub async fn handle(&self, delivery: &Delivery) -> DeliveryOutcome {
        let span = info_span!(
            "delivery",
            delivery_id = %delivery.id,
            attempts = delivery.attempts
        );

        let outcome = AssertUnwindSafe(self.handle_body(&delivery.body))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|_| {
                error!(delivery_id = %delivery.id, "Panic while handling delivery");
                DeliveryOutcome::RejectedPermanent
            });

        match outcome {
            DeliveryOutcome::Processed => self.stats.record_processed(),
            DeliveryOutcome::RejectedTransient => self.stats.record_rejected_transient(),
            DeliveryOutcome::RejectedPermanent => self.stats.record_rejected_permanent(),
        }

        outcome
    }

    /// Handle a raw message body.
    pub async fn handle_body(&self, body: &[u8]) -> DeliveryOutcome {
        let envelope = match EventEnvelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(raw = %e.raw, error = %e, "Dropping malformed message body");
                return DeliveryOutcome::RejectedPermanent;
            }
        };

        let request = match self.dispatcher.translate(&envelope.kind, &envelope.payload) {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!(kind = %envelope.kind, "Event kind is not forwarded");
                return DeliveryOutcome::Processed;
            }
            Err(e) => {
                warn!(
                    kind = %envelope.kind,
                    payload = %serde_json::Value::Object(envelope.payload.clone()),
                    error = %e,
                    "Dropping event that cannot be translated"
                );
                return DeliveryOutcome::RejectedPermanent;
            }
        };

        debug!(kind = %envelope.kind, "Forwarding event to gateway");
        self.stats.record_gateway_call();

        match self.gateway.send(&request).await {
            Ok(_) => DeliveryOutcome::Processed,
            Err(e) if e.is_transient() => DeliveryOutcome::RejectedTransient,
            Err(_) => DeliveryOutcome::Processed,
        }
    }
}
