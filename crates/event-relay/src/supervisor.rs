//! Connection supervisor for the consuming side.
//!
//! Owns one broker channel, consumes the durable queue one message at a
//! time and reconnects after any broker fault with a fixed backoff. It
//! never gives up on its own; only cancellation stops it.
//!
//! ```text
//! Disconnected -> Connecting --ok--> Connected --fault--> Connecting
//!                    |   ^                                    |
//!                  fail  +------------- Backoff <-------------+
//! ```

use crate::broker::{open_channel, BrokerChannel, BrokerConnector, BrokerError, Delivery};
use crate::config::SupervisorConfig;
use crate::delivery::{AckPolicy, DeliveryHandler, Disposition};
use crate::error::RelayResult;
use crate::gateway::Gateway;
use crate::stats::RelayStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of the consuming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached only through shutdown
    Closed,
}

enum Phase<Ch> {
    Connecting,
    Connected(Ch),
    Backoff,
}

enum Interrupt {
    Cancelled,
    Fault(BrokerError),
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` if cancelled.
pub(crate) async fn backoff_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

/// Consumes the durable queue and forwards each message.
pub struct Supervisor<C: BrokerConnector, G> {
    connector: Arc<C>,
    handler: DeliveryHandler<G>,
    policy: AckPolicy,
    queue: String,
    config: SupervisorConfig,
    stats: Arc<RelayStats>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl<C: BrokerConnector, G: Gateway> Supervisor<C, G> {
    pub fn new(
        connector: Arc<C>,
        handler: DeliveryHandler<G>,
        policy: AckPolicy,
        queue: impl Into<String>,
        config: SupervisorConfig,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            handler,
            policy,
            queue: queue.into(),
            config,
            stats,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the supervisor loop.
    pub fn spawn(self) -> SupervisorHandle {
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let grace = self.config.shutdown_grace;

        let task = tokio::spawn(self.run());
        SupervisorHandle {
            cancel,
            state,
            grace,
            task: Some(task),
        }
    }

    async fn run(self) {
        info!(queue = %self.queue, policy = ?self.policy, "Connection supervisor starting");

        let mut phase = Phase::Connecting;
        loop {
            phase = match phase {
                Phase::Connecting => {
                    self.set_state(ConnectionState::Connecting);
                    let opened = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        opened = open_channel(self.connector.as_ref(), &self.queue) => opened,
                    };

                    match opened {
                        Ok(channel) => {
                            info!(queue = %self.queue, "Connected to broker");
                            self.set_state(ConnectionState::Connected);
                            Phase::Connected(channel)
                        }
                        Err(e) => {
                            self.log_fault(&e, "Failed to open broker channel");
                            Phase::Backoff
                        }
                    }
                }

                Phase::Backoff => {
                    self.stats.record_backoff_sleep();
                    debug!(
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "Waiting before reconnecting"
                    );
                    if !backoff_sleep(self.config.reconnect_backoff, &self.cancel).await {
                        break;
                    }
                    self.stats.record_reconnect();
                    Phase::Connecting
                }

                Phase::Connected(mut channel) => match self.consume(&mut channel).await {
                    Interrupt::Cancelled => {
                        channel.close().await;
                        break;
                    }
                    Interrupt::Fault(e) => {
                        self.log_fault(&e, "Lost broker channel, reconnecting");
                        channel.close().await;
                        self.set_state(ConnectionState::Connecting);
                        Phase::Backoff
                    }
                },
            };
        }

        self.set_state(ConnectionState::Closed);
        info!(queue = %self.queue, "Connection supervisor stopped");
    }

    /// Consume until cancelled or the channel fails.
    async fn consume(&self, channel: &mut C::Channel) -> Interrupt {
        loop {
            let delivery = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Interrupt::Cancelled,
                next = timeout(self.config.read_deadline, channel.next_delivery(&self.queue)) => match next {
                    Ok(Ok(Some(delivery))) => delivery,
                    Ok(Ok(None)) => {
                        debug!(queue = %self.queue, "No messages within heartbeat");
                        continue;
                    }
                    Ok(Err(e)) => return Interrupt::Fault(e),
                    // A half-open connection never answers a blocking read
                    Err(_) => return Interrupt::Fault(BrokerError::Timeout(self.config.read_deadline)),
                },
            };

            // The in-flight message is always settled before cancellation is observed.
            let outcome = self.handler.handle(&delivery).await;
            let disposition = self.policy.resolve(outcome, delivery.attempts);

            debug!(
                delivery_id = %delivery.id,
                ?outcome,
                ?disposition,
                "Settling delivery"
            );

            if let Err(e) = self.settle(channel, &delivery, disposition).await {
                return Interrupt::Fault(e);
            }
        }
    }

    async fn settle(
        &self,
        channel: &mut C::Channel,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => channel.ack(&self.queue, delivery).await,
            Disposition::Requeue => {
                channel.requeue(&self.queue, delivery).await?;
                self.stats.record_requeued();
                warn!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts + 1,
                    "Requeued delivery for retry"
                );
                Ok(())
            }
            Disposition::DeadLetter => {
                channel.dead_letter(&self.queue, delivery).await?;
                self.stats.record_dead_lettered();
                error!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts + 1,
                    "Moved delivery to dead-letter queue"
                );
                Ok(())
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn log_fault(&self, e: &BrokerError, message: &str) {
        if e.is_connection_fault() {
            warn!(queue = %self.queue, error = %e, "{message}");
        } else {
            error!(queue = %self.queue, error = %e, "{message}");
        }
    }
}

/// Owner of a running supervisor.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    grace: Duration,
    task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Stop consuming.
    ///
    /// An in-flight message may finish within the grace period; after that
    /// the task is aborted and its channel dropped.
    pub async fn shutdown(mut self) -> RelayResult<()> {
        self.cancel.cancel();

        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.grace, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "Supervisor did not stop within grace period, aborting"
                );
                task.abort();
                self.state.send_replace(ConnectionState::Closed);
            }
        }

        Ok(())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleep_completes() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        assert!(backoff_sleep(Duration::from_secs(5), &cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleep_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        assert!(!backoff_sleep(Duration::from_secs(60), &cancel).await);
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
