//! Broker abstraction.
//!
//! The relay drives a broker through two traits: a [`BrokerConnector`]
//! that opens channels, and the [`BrokerChannel`] itself. A channel is
//! owned by exactly one task and is never shared.

mod redis_streams;

pub use redis_streams::{RedisChannel, RedisConnector};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The connection was closed by the broker or the network
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel was closed while the connection may still be alive
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A connection attempt did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected broker reply
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether this error means the connection or channel is unusable.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            BrokerError::ConnectionClosed(_)
            | BrokerError::ChannelClosed(_)
            | BrokerError::Timeout(_) => true,
            BrokerError::Protocol(_) => false,
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Delivery mode of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Transient => "transient",
            DeliveryMode::Persistent => "persistent",
        }
    }
}

/// A message to be written to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    /// Number of earlier handling attempts (non-zero for requeued messages)
    pub attempts: u32,
}

impl OutboundMessage {
    /// A fresh persistent message.
    pub fn persistent(body: Vec<u8>) -> Self {
        Self {
            body,
            delivery_mode: DeliveryMode::Persistent,
            attempts: 0,
        }
    }
}

/// A message delivered to a consumer, awaiting exactly one ack/requeue/dead-letter.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned message id
    pub id: String,
    pub body: Vec<u8>,
    /// Number of earlier handling attempts
    pub attempts: u32,
}

/// Opens channels to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new connection and channel.
    async fn connect(&self) -> BrokerResult<Self::Channel>;
}

/// A single broker channel.
#[async_trait]
pub trait BrokerChannel: Send + 'static {
    /// Declare the durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&mut self, queue: &str) -> BrokerResult<()>;

    /// Write one message to the queue.
    async fn publish(&mut self, queue: &str, message: &OutboundMessage) -> BrokerResult<()>;

    /// Wait for the next delivery.
    ///
    /// Returns `None` when the heartbeat interval passes with nothing to deliver.
    async fn next_delivery(&mut self, queue: &str) -> BrokerResult<Option<Delivery>>;

    /// Mark a delivery as done.
    async fn ack(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()>;

    /// Put a delivery back on the queue with its attempt count incremented.
    async fn requeue(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()>;

    /// Move a delivery to the queue's dead-letter queue.
    async fn dead_letter(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()>;

    /// Release the channel.
    async fn close(&mut self);
}

/// Connect and declare `queue`. The channel is closed if the declaration fails.
pub(crate) async fn open_channel<C: BrokerConnector>(
    connector: &C,
    queue: &str,
) -> BrokerResult<C::Channel> {
    let mut channel = connector.connect().await?;
    if let Err(e) = channel.declare_queue(queue).await {
        channel.close().await;
        return Err(e);
    }
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert!(BrokerError::ConnectionClosed("eof".into()).is_connection_fault());
        assert!(BrokerError::ChannelClosed("reset".into()).is_connection_fault());
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_connection_fault());
        assert!(!BrokerError::Protocol("bad reply".into()).is_connection_fault());
    }

    #[test]
    fn test_redis_io_error_is_fault() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = BrokerError::from(redis::RedisError::from(io));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn test_persistent_message() {
        let msg = OutboundMessage::persistent(b"{}".to_vec());
        assert_eq!(msg.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(msg.delivery_mode.as_str(), "persistent");
        assert_eq!(msg.attempts, 0);
    }
}
