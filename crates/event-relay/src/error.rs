//! Error types for the event relay.

use thiserror::Error;

pub use crate::broker::BrokerError;
pub use crate::dispatcher::TranslationError;
pub use crate::envelope::DecodeError;
pub use crate::gateway::GatewayError;

/// Relay error type.
///
/// Only surfaces at the relay's outer edges (construction, `publish`,
/// shutdown). Faults inside message handling are turned into a
/// [`DeliveryOutcome`](crate::delivery::DeliveryOutcome) instead.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The relay (or its publisher) has been shut down
    #[error("Relay is closed")]
    Closed,

    /// Event data that cannot form an envelope payload
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    /// Broker connection or operation error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Gateway client construction error
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
