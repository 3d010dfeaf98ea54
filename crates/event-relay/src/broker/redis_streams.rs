//! Redis Streams binding for the broker traits.
//!
//! A durable queue is a stream plus a consumer group. Consumption uses
//! XREADGROUP with COUNT=1 and explicit XACK. After every (re)connect the
//! channel first replays this consumer's own pending entries, so a message
//! whose ack was lost to a connection fault is delivered again.
//!
//! Entries left pending by a consumer that never came back (crash, forced
//! shutdown, a retired instance) are taken over with XAUTOCLAIM once they
//! have been idle for `claim_idle`. This runs on connect and after every
//! idle heartbeat, and needs Redis 6.2 or later.

use super::{BrokerChannel, BrokerConnector, BrokerError, BrokerResult, Delivery, OutboundMessage};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const FIELD_BODY: &str = "body";
const FIELD_ATTEMPTS: &str = "attempts";
const FIELD_DELIVERY_MODE: &str = "delivery_mode";
const FIELD_PUBLISHED_AT: &str = "published_at";

/// Entries examined per XAUTOCLAIM call.
const CLAIM_BATCH: usize = 100;

/// Opens Redis connections according to [`BrokerConfig`].
pub struct RedisConnector {
    client: Client,
    config: BrokerConfig,
}

impl RedisConnector {
    /// Create a connector. Does not touch the network.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        let client = Client::open(config.url().as_str())?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    type Channel = RedisChannel;

    /// Connect, making up to `connection_attempts` attempts.
    async fn connect(&self) -> BrokerResult<RedisChannel> {
        let attempts = self.config.connection_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = timeout(
                self.config.connection_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await;

            let error = match result {
                Ok(Ok(conn)) => {
                    info!(url = %self.config.url(), attempt, "Connected to broker");
                    return Ok(RedisChannel::new(conn, &self.config));
                }
                Ok(Err(e)) => BrokerError::from(e),
                Err(_) => BrokerError::Timeout(self.config.connection_timeout),
            };

            if attempt < attempts {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %error,
                    "Failed to connect to broker, retrying..."
                );
                sleep(self.config.attempt_delay).await;
            }
            last_error = Some(error);
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::ConnectionClosed("no connection attempt made".into())))
    }
}

/// One Redis connection used as a relay channel.
pub struct RedisChannel {
    conn: MultiplexedConnection,
    consumer_group: String,
    consumer_name: String,
    dead_letter_queue: String,
    block_ms: u64,
    claim_idle_ms: u64,
    claim_due: bool,
    replaying_pending: bool,
}

impl RedisChannel {
    fn new(conn: MultiplexedConnection, config: &BrokerConfig) -> Self {
        Self {
            conn,
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
            dead_letter_queue: config.dead_letter_queue(),
            block_ms: config.heartbeat.as_millis() as u64,
            claim_idle_ms: config.claim_idle.as_millis() as u64,
            claim_due: true,
            replaying_pending: true,
        }
    }

    async fn xadd(
        &mut self,
        stream: &str,
        body: &[u8],
        delivery_mode: &str,
        attempts: u32,
    ) -> BrokerResult<String> {
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(body)
            .arg(FIELD_DELIVERY_MODE)
            .arg(delivery_mode)
            .arg(FIELD_ATTEMPTS)
            .arg(attempts)
            .arg(FIELD_PUBLISHED_AT)
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(&mut self.conn)
            .await?;
        Ok(id)
    }

    /// Re-add `delivery` to `target` and ack the original, atomically.
    async fn move_delivery(
        &mut self,
        queue: &str,
        target: &str,
        delivery: &Delivery,
        attempts: u32,
    ) -> BrokerResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(target)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(&delivery.body)
            .arg(FIELD_DELIVERY_MODE)
            .arg("persistent")
            .arg(FIELD_ATTEMPTS)
            .arg(attempts)
            .arg(FIELD_PUBLISHED_AT)
            .arg(chrono::Utc::now().to_rfc3339())
            .ignore()
            .cmd("XACK")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg(&delivery.id)
            .ignore();

        let (): () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Take over entries other consumers left pending past `claim_idle`.
    ///
    /// Returns how many entries were claimed.
    async fn claim_stale(&mut self, queue: &str) -> BrokerResult<usize> {
        let mut cursor = "0-0".to_string();
        let mut claimed = 0;

        loop {
            // XAUTOCLAIM key group consumer min-idle start COUNT n JUSTID
            let reply: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(queue)
                .arg(&self.consumer_group)
                .arg(&self.consumer_name)
                .arg(self.claim_idle_ms)
                .arg(&cursor)
                .arg("COUNT")
                .arg(CLAIM_BATCH)
                .arg("JUSTID")
                .query_async(&mut self.conn)
                .await?;

            let (next, ids) = parse_xautoclaim_response(reply)?;
            claimed += ids;
            if next == "0-0" {
                return Ok(claimed);
            }
            cursor = next;
        }
    }

    async fn read_one(&mut self, queue: &str, from_id: &str) -> BrokerResult<Option<Delivery>> {
        // XREADGROUP GROUP group consumer COUNT 1 BLOCK ms STREAMS key id
        // "0" replays this consumer's pending entries, ">" reads new ones
        let result: RedisResult<redis::Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(queue)
            .arg(from_id)
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(value) => parse_xreadgroup_response(value),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn declare_queue(&mut self, queue: &str) -> BrokerResult<()> {
        // XGROUP CREATE key group 0 MKSTREAM
        // Starting at 0 keeps messages published before the group existed
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => {
                info!(queue = %queue, group = %self.consumer_group, "Declared queue");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(queue = %queue, group = %self.consumer_group, "Queue already declared");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&mut self, queue: &str, message: &OutboundMessage) -> BrokerResult<()> {
        let id = self
            .xadd(
                queue,
                &message.body,
                message.delivery_mode.as_str(),
                message.attempts,
            )
            .await?;
        debug!(queue = %queue, message_id = %id, "Published message");
        Ok(())
    }

    async fn next_delivery(&mut self, queue: &str) -> BrokerResult<Option<Delivery>> {
        if self.claim_due {
            self.claim_due = false;
            let claimed = self.claim_stale(queue).await?;
            if claimed > 0 {
                warn!(
                    queue = %queue,
                    consumer = %self.consumer_name,
                    claimed,
                    "Claimed messages abandoned by another consumer"
                );
                self.replaying_pending = true;
            }
        }

        if self.replaying_pending {
            match self.read_one(queue, "0").await? {
                Some(delivery) => {
                    info!(
                        queue = %queue,
                        message_id = %delivery.id,
                        "Redelivering pending message"
                    );
                    return Ok(Some(delivery));
                }
                None => {
                    debug!(queue = %queue, "No pending messages left to replay");
                    self.replaying_pending = false;
                }
            }
        }
        let next = self.read_one(queue, ">").await?;
        if next.is_none() {
            self.claim_due = true;
        }
        Ok(next)
    }

    async fn ack(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()> {
        let result: i64 = self
            .conn
            .xack(queue, &self.consumer_group, &[&delivery.id])
            .await?;

        if result != 1 {
            warn!(
                message_id = %delivery.id,
                queue = %queue,
                "XACK returned {}, message may not exist",
                result
            );
        }
        Ok(())
    }

    async fn requeue(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()> {
        self.move_delivery(queue, queue, delivery, delivery.attempts + 1)
            .await
    }

    async fn dead_letter(&mut self, queue: &str, delivery: &Delivery) -> BrokerResult<()> {
        let target = self.dead_letter_queue.clone();
        self.move_delivery(queue, &target, delivery, delivery.attempts + 1)
            .await
    }

    async fn close(&mut self) {
        // Multiplexed connections close when the last handle drops
        debug!(consumer = %self.consumer_name, "Closing broker channel");
    }
}

/// `BUSYGROUP` means the consumer group (and so the queue) already exists.
fn is_busy_group(error: &RedisError) -> bool {
    error.code() == Some("BUSYGROUP") || error.to_string().contains("BUSYGROUP")
}

/// Parse an XREADGROUP reply into at most one delivery.
///
/// Reply shape: `[[stream, [[id, [field, value, ...]]]]]`, or nil when the
/// block timeout expired. An entry whose fields are nil (deleted while
/// pending) or lack a body yields an empty body, which fails to decode and
/// is dropped by the delivery discipline.
fn parse_xreadgroup_response(value: redis::Value) -> BrokerResult<Option<Delivery>> {
    let streams = match value {
        redis::Value::Array(streams) => streams,
        redis::Value::Nil => return Ok(None),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XREADGROUP response type: {:?}",
                other
            )))
        }
    };

    let Some(stream) = streams.into_iter().next() else {
        return Ok(None);
    };

    let mut stream = match stream {
        redis::Value::Array(s) if s.len() >= 2 => s,
        _ => {
            return Err(BrokerError::Protocol(
                "Expected [key, entries] for stream".to_string(),
            ))
        }
    };

    let entries = match stream.swap_remove(1) {
        redis::Value::Array(entries) => entries,
        redis::Value::Nil => return Ok(None),
        _ => {
            return Err(BrokerError::Protocol(
                "Expected array for stream entries".to_string(),
            ))
        }
    };

    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let mut entry = match entry {
        redis::Value::Array(e) if e.len() >= 2 => e,
        _ => return Err(BrokerError::Protocol("Stream entry too short".to_string())),
    };

    let fields = entry.swap_remove(1);
    let id = value_to_string(&entry[0]).ok_or_else(|| {
        BrokerError::Protocol(format!("Expected string for message ID, got {:?}", entry[0]))
    })?;

    let mut body = Vec::new();
    let mut attempts = 0;

    if let redis::Value::Array(fields) = fields {
        for pair in fields.chunks_exact(2) {
            match value_to_string(&pair[0]).as_deref() {
                Some(FIELD_BODY) => body = value_to_bytes(&pair[1]).unwrap_or_default(),
                Some(FIELD_ATTEMPTS) => {
                    attempts = value_to_string(&pair[1])
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0)
                }
                _ => {}
            }
        }
    }

    debug!(message_id = %id, body_len = body.len(), attempts, "Read message from stream");

    Ok(Some(Delivery { id, body, attempts }))
}

/// Parse an XAUTOCLAIM JUSTID reply into the next cursor and the number
/// of claimed ids.
///
/// Reply shape: `[cursor, [id, ...]]`, with a third element listing
/// deleted ids on Redis 7.
fn parse_xautoclaim_response(value: redis::Value) -> BrokerResult<(String, usize)> {
    let mut parts = match value {
        redis::Value::Array(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XAUTOCLAIM response: {:?}",
                other
            )))
        }
    };

    let claimed = match parts.swap_remove(1) {
        redis::Value::Array(ids) => ids.len(),
        redis::Value::Nil => 0,
        other => {
            return Err(BrokerError::Protocol(format!(
                "Expected array of claimed ids, got {:?}",
                other
            )))
        }
    };
    let cursor = value_to_string(&parts[0]).ok_or_else(|| {
        BrokerError::Protocol(format!("Expected string cursor, got {:?}", parts[0]))
    })?;

    Ok((cursor, claimed))
}

fn value_to_bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(s) => Some(s.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(s) => Some(String::from_utf8_lossy(s).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}
