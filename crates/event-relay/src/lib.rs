//! Event relay: durable hand-off of domain events to a downstream gateway.
//!
//! Producers enqueue events through a non-blocking [`PublisherHandle`]; a
//! single worker writes them, in order, to a durable broker queue. A
//! connection [`Supervisor`] consumes that queue one message at a time,
//! translates each event into a gateway mutation and settles the message
//! according to the configured [`AckPolicy`].
//!
//! # Architecture
//!
//! ```text
//! publish_event -> Publisher -> durable queue -> Supervisor -> Dispatcher -> Gateway
//!                                    ^                |
//!                                    |__ ack/requeue _|
//! ```
//!
//! # Guarantees
//!
//! 1. **FIFO**: one caller's events reach the broker in call order
//! 2. **No silent drops**: a failed publish is retried on a fresh channel
//! 3. **One In-Flight**: each supervisor handles one message at a time
//! 4. **At-Least-Once**: unsettled messages are redelivered after a reconnect

pub mod broker;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod mutation;
pub mod publisher;
pub mod relay;
pub mod stats;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use broker::{BrokerChannel, BrokerConnector, BrokerError, Delivery, RedisConnector};
pub use config::RelayConfig;
pub use delivery::{AckPolicy, DeliveryHandler, DeliveryOutcome, Disposition};
pub use dispatcher::{Dispatcher, TranslationError};
pub use envelope::EventEnvelope;
pub use error::{RelayError, RelayResult};
pub use gateway::{Gateway, GatewayError, GatewayResponse, HttpGateway};
pub use mutation::{MutationBuilder, MutationRequest};
pub use publisher::{Publisher, PublisherHandle};
pub use relay::Relay;
pub use stats::{RelayStats, StatsSnapshot};
pub use supervisor::{ConnectionState, Supervisor, SupervisorHandle};
