//! Outbound publisher.
//!
//! Callers hand envelopes to a [`PublisherHandle`], which never touches
//! the network. One worker task owns the broker channel and writes the
//! envelopes in submission order, retrying each one until it is written.

use crate::broker::{open_channel, BrokerChannel, BrokerConnector, OutboundMessage};
use crate::config::PublisherConfig;
use crate::envelope::EventEnvelope;
use crate::error::{RelayError, RelayResult};
use crate::stats::RelayStats;
use crate::supervisor::backoff_sleep;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time given to the worker to close its channel after draining.
const CLOSE_MARGIN: Duration = Duration::from_millis(500);

/// Cloneable, non-blocking entry point for producers.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl PublisherHandle {
    /// Enqueue an envelope for publishing.
    ///
    /// Fails only with [`RelayError::Closed`] once the publisher has shut down.
    pub fn publish(&self, envelope: EventEnvelope) -> RelayResult<()> {
        self.tx.send(envelope).map_err(|_| RelayError::Closed)
    }

    /// Serialize `data` as the payload of a `kind` event and enqueue it.
    ///
    /// `data` must serialize to a JSON object. Returns `Ok(true)` once the
    /// event is queued.
    pub fn publish_event<T: Serialize>(&self, kind: &str, data: T) -> RelayResult<bool> {
        let payload = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            other => {
                return Err(RelayError::InvalidPayload(format!(
                    "event data must be a JSON object, got {other}"
                )))
            }
        };

        self.publish(EventEnvelope::new(kind, payload))?;
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running publisher worker.
pub struct Publisher {
    handle: PublisherHandle,
    cancel: CancellationToken,
    grace: Duration,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Spawn the worker for `queue`.
    pub fn start<C: BrokerConnector>(
        connector: Arc<C>,
        queue: impl Into<String>,
        config: PublisherConfig,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let grace = config.shutdown_grace;

        let worker = PublishWorker {
            connector,
            queue: queue.into(),
            config,
            stats,
            channel: None,
        };
        let task = tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            handle: PublisherHandle { tx },
            cancel,
            grace,
            task,
        }
    }

    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    /// Stop accepting envelopes, drain the queue within the grace period
    /// and close the channel.
    pub async fn shutdown(self) -> RelayResult<()> {
        self.cancel.cancel();

        let mut task = self.task;
        match tokio::time::timeout(self.grace + CLOSE_MARGIN, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!("Publisher did not stop in time, aborting");
                task.abort();
            }
        }

        Ok(())
    }
}

struct PublishWorker<C: BrokerConnector> {
    connector: Arc<C>,
    queue: String,
    config: PublisherConfig,
    stats: Arc<RelayStats>,
    channel: Option<C::Channel>,
}

impl<C: BrokerConnector> PublishWorker<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EventEnvelope>, cancel: CancellationToken) {
        info!(queue = %self.queue, "Publisher starting");

        let mut unsent = None;
        loop {
            let envelope = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if !self.publish_until_sent(&envelope, &cancel).await {
                unsent = Some(envelope);
                break;
            }
        }

        rx.close();
        self.drain(unsent, &mut rx).await;

        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        info!(queue = %self.queue, "Publisher stopped");
    }

    /// Publish what is still queued, bounded by the grace period.
    async fn drain(
        &mut self,
        unsent: Option<EventEnvelope>,
        rx: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    ) {
        let grace = self.config.shutdown_grace;
        let uncancelled = CancellationToken::new();

        let drained = tokio::time::timeout(grace, async {
            if let Some(envelope) = unsent {
                self.publish_until_sent(&envelope, &uncancelled).await;
            }
            while let Some(envelope) = rx.recv().await {
                self.publish_until_sent(&envelope, &uncancelled).await;
            }
        })
        .await;

        if drained.is_err() {
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            error!(
                queue = %self.queue,
                dropped,
                grace_ms = grace.as_millis() as u64,
                "Publisher drain exceeded grace period"
            );
        }
    }

    /// Publish one envelope, reopening the channel until it succeeds.
    ///
    /// Returns `false` only if cancelled before the envelope was written.
    async fn publish_until_sent(&mut self, envelope: &EventEnvelope, cancel: &CancellationToken) -> bool {
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "Dropping unserializable envelope");
                return true;
            }
        };
        let message = OutboundMessage::persistent(body);

        loop {
            if !self.ensure_channel(cancel).await {
                return false;
            }
            let Some(channel) = self.channel.as_mut() else {
                continue;
            };

            match channel.publish(&self.queue, &message).await {
                Ok(()) => {
                    self.stats.record_published();
                    debug!(queue = %self.queue, kind = %envelope.kind, "Published event");
                    return true;
                }
                Err(e) => {
                    self.stats.record_publish_retry();
                    warn!(
                        queue = %self.queue,
                        kind = %envelope.kind,
                        error = %e,
                        "Publish failed, reopening channel"
                    );

                    if let Some(mut channel) = self.channel.take() {
                        channel.close().await;
                    }

                    // A reopened channel will not fix a rejected command.
                    if !e.is_connection_fault() {
                        self.stats.record_backoff_sleep();
                        if !backoff_sleep(self.config.reconnect_backoff, cancel).await {
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Open a channel and declare the queue, backing off between failures.
    async fn ensure_channel(&mut self, cancel: &CancellationToken) -> bool {
        while self.channel.is_none() {
            match open_channel(self.connector.as_ref(), &self.queue).await {
                Ok(channel) => {
                    info!(queue = %self.queue, "Publisher connected to broker");
                    self.channel = Some(channel);
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Publisher failed to connect");
                    self.stats.record_backoff_sleep();
                    if !backoff_sleep(self.config.reconnect_backoff, cancel).await {
                        return false;
                    }
                    self.stats.record_reconnect();
                }
            }
        }
        true
    }
}
