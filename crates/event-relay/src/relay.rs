//! The relay lifetime object.

use crate::broker::{BrokerConnector, RedisConnector};
use crate::config::RelayConfig;
use crate::delivery::DeliveryHandler;
use crate::dispatcher::Dispatcher;
use crate::error::RelayResult;
use crate::gateway::{Gateway, HttpGateway};
use crate::publisher::{Publisher, PublisherHandle};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::supervisor::{ConnectionState, Supervisor, SupervisorHandle};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A running relay: one publisher worker and one connection supervisor.
///
/// Created at process startup and torn down with [`Relay::shutdown`].
pub struct Relay {
    publisher: Publisher,
    supervisor: SupervisorHandle,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Start the relay against the given broker and gateway.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C, G>(config: RelayConfig, connector: Arc<C>, gateway: Arc<G>) -> Self
    where
        C: BrokerConnector,
        G: Gateway,
    {
        let stats = Arc::new(RelayStats::default());
        let queue = config.broker.queue_name.clone();

        let publisher = Publisher::start(
            connector.clone(),
            queue.clone(),
            config.publisher,
            stats.clone(),
        );

        let handler = DeliveryHandler::new(Dispatcher::default(), gateway, stats.clone());
        let supervisor = Supervisor::new(
            connector,
            handler,
            config.ack_policy,
            queue,
            config.supervisor,
            stats.clone(),
        )
        .spawn();

        Self {
            publisher,
            supervisor,
            stats,
        }
    }

    /// Start the relay with the Redis broker and HTTP gateway.
    pub fn connect(config: RelayConfig) -> RelayResult<Self> {
        let connector = Arc::new(RedisConnector::new(config.broker.clone())?);
        let gateway = Arc::new(HttpGateway::new(config.gateway.clone())?);

        info!(
            broker = %config.broker.url(),
            queue = %config.broker.queue_name,
            gateway = %gateway.url(),
            "Starting event relay"
        );

        Ok(Self::start(config, connector, gateway))
    }

    pub fn publisher(&self) -> PublisherHandle {
        self.publisher.handle()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    /// Drain the publisher, then stop the supervisor.
    ///
    /// Returns the final counters.
    pub async fn shutdown(self) -> RelayResult<StatsSnapshot> {
        info!("Shutting down event relay");

        let published = self.publisher.shutdown().await;
        let consumed = self.supervisor.shutdown().await;

        let snapshot = self.stats.snapshot();
        info!(
            published = snapshot.published,
            processed = snapshot.processed,
            rejected_permanent = snapshot.rejected_permanent,
            rejected_transient = snapshot.rejected_transient,
            requeued = snapshot.requeued,
            dead_lettered = snapshot.dead_lettered,
            reconnects = snapshot.reconnects,
            "Event relay stopped"
        );

        published?;
        consumed?;
        Ok(snapshot)
    }
}
