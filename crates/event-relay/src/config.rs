//! Configuration for the event relay.
//!
//! A [`RelayConfig`] is built once at startup and its parts are handed to
//! each component's constructor.

use crate::delivery::AckPolicy;
use crate::error::{RelayError, RelayResult};
use std::str::FromStr;
use std::time::Duration;

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host name
    pub host: String,

    /// Broker port
    pub port: u16,

    /// How long an idle consumer waits on the broker before polling again
    pub heartbeat: Duration,

    /// Connection attempts within a single connect call
    pub connection_attempts: u32,

    /// Deadline for each connection attempt
    pub connection_timeout: Duration,

    /// Delay between connection attempts
    pub attempt_delay: Duration,

    /// Name of the durable queue
    pub queue_name: String,

    /// Consumer group shared by all relay instances on this queue
    pub consumer_group: String,

    /// Consumer name. Must be unique per instance and stable across its
    /// restarts, so a restarted instance replays its own pending messages.
    pub consumer_name: String,

    /// Pending messages idle for this long are taken over from whichever
    /// consumer holds them. Must exceed the longest handling time.
    pub claim_idle: Duration,
}

impl BrokerConfig {
    /// Connection URL for the broker.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// Name of the queue that receives dead-lettered messages.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead-letter", self.queue_name)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            heartbeat: Duration::from_secs(60),
            connection_attempts: 3,
            connection_timeout: Duration::from_secs(10),
            attempt_delay: Duration::from_secs(2),
            queue_name: "events".to_string(),
            consumer_group: "event-relay".to_string(),
            consumer_name: "event-relay".to_string(),
            claim_idle: Duration::from_secs(60),
        }
    }
}

/// Connection supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fixed sleep between reconnect attempts
    pub reconnect_backoff: Duration,

    /// Time allowed to finish the in-flight message on shutdown
    pub shutdown_grace: Duration,

    /// Longest wait for one read before the channel is treated as dead.
    /// Must exceed the broker heartbeat.
    pub read_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            reconnect_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            read_deadline: broker.heartbeat + broker.connection_timeout,
        }
    }
}

/// Outbound publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Fixed sleep between reconnect attempts
    pub reconnect_backoff: Duration,

    /// Time allowed to drain queued envelopes on shutdown
    pub shutdown_grace: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Downstream gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint receiving `{ "query": ... }` POSTs
    pub url: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/graphql".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: format!("event-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub supervisor: SupervisorConfig,
    pub publisher: PublisherConfig,
    pub gateway: GatewayConfig,
    pub ack_policy: AckPolicy,
}

impl RelayConfig {
    /// Build the configuration from process environment variables.
    ///
    /// Unset variables fall back to defaults; unparsable ones are an error.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();

        let broker = BrokerConfig {
            host: lookup("BROKER_HOST").unwrap_or(defaults.broker.host),
            port: parse_or(&lookup, "BROKER_PORT", defaults.broker.port)?,
            heartbeat: secs_or(&lookup, "BROKER_HEARTBEAT", defaults.broker.heartbeat)?,
            connection_attempts: parse_or(
                &lookup,
                "BROKER_CONNECTION_ATTEMPTS",
                defaults.broker.connection_attempts,
            )?,
            connection_timeout: secs_or(
                &lookup,
                "BROKER_CONNECTION_TIMEOUT",
                defaults.broker.connection_timeout,
            )?,
            attempt_delay: secs_or(&lookup, "BROKER_ATTEMPT_DELAY", defaults.broker.attempt_delay)?,
            queue_name: lookup("QUEUE_NAME").unwrap_or(defaults.broker.queue_name),
            consumer_group: lookup("RELAY_CONSUMER_GROUP").unwrap_or(defaults.broker.consumer_group),
            consumer_name: lookup("RELAY_CONSUMER_NAME")
                .or_else(|| lookup("HOSTNAME").map(|host| format!("event-relay-{host}")))
                .unwrap_or(defaults.broker.consumer_name),
            claim_idle: secs_or(&lookup, "BROKER_CLAIM_IDLE", defaults.broker.claim_idle)?,
        };

        let reconnect_backoff = millis_or(
            &lookup,
            "RELAY_RECONNECT_BACKOFF_MS",
            defaults.supervisor.reconnect_backoff,
        )?;
        let shutdown_grace = millis_or(
            &lookup,
            "RELAY_SHUTDOWN_GRACE_MS",
            defaults.supervisor.shutdown_grace,
        )?;

        let gateway = GatewayConfig {
            url: lookup("GATEWAY_URL").unwrap_or(defaults.gateway.url),
            timeout: secs_or(&lookup, "GATEWAY_TIMEOUT_SECS", defaults.gateway.timeout)?,
            user_agent: defaults.gateway.user_agent,
        };

        let ack_policy = match lookup("RELAY_ACK_POLICY") {
            None => defaults.ack_policy,
            Some(name) => {
                let max_attempts = parse_or(&lookup, "RELAY_MAX_ATTEMPTS", 5u32)?;
                AckPolicy::parse(&name, max_attempts)?
            }
        };

        if broker.queue_name.is_empty() {
            return Err(RelayError::Config("QUEUE_NAME must not be empty".to_string()));
        }
        if broker.consumer_name.is_empty() {
            return Err(RelayError::Config(
                "RELAY_CONSUMER_NAME must not be empty".to_string(),
            ));
        }

        let read_deadline = broker.heartbeat + broker.connection_timeout;

        Ok(Self {
            broker,
            supervisor: SupervisorConfig {
                reconnect_backoff,
                shutdown_grace,
                read_deadline,
            },
            publisher: PublisherConfig {
                reconnect_backoff,
                shutdown_grace,
            },
            gateway,
            ack_policy,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> RelayResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> RelayResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> RelayResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 6379);
        assert_eq!(config.broker.queue_name, "events");
        assert_eq!(config.broker.connection_attempts, 3);
        assert_eq!(config.broker.consumer_name, "event-relay");
        assert_eq!(config.broker.claim_idle, Duration::from_secs(60));
        assert_eq!(config.supervisor.read_deadline, Duration::from_secs(70));
        assert_eq!(config.supervisor.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(config.gateway.timeout, Duration::from_secs(10));
        assert_eq!(config.ack_policy, AckPolicy::AckAlways);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("BROKER_HOST", "broker.internal"),
            ("BROKER_PORT", "6380"),
            ("BROKER_HEARTBEAT", "30"),
            ("BROKER_CONNECTION_ATTEMPTS", "7"),
            ("BROKER_ATTEMPT_DELAY", "1"),
            ("QUEUE_NAME", "team-events"),
            ("RELAY_RECONNECT_BACKOFF_MS", "250"),
            ("GATEWAY_URL", "http://gateway:4000/graphql"),
            ("RELAY_ACK_POLICY", "retry-then-dead-letter"),
            ("RELAY_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.broker.url(), "redis://broker.internal:6380/");
        assert_eq!(config.broker.heartbeat, Duration::from_secs(30));
        assert_eq!(config.broker.connection_attempts, 7);
        assert_eq!(config.broker.attempt_delay, Duration::from_secs(1));
        assert_eq!(config.broker.dead_letter_queue(), "team-events.dead-letter");
        assert_eq!(config.supervisor.reconnect_backoff, Duration::from_millis(250));
        assert_eq!(config.publisher.reconnect_backoff, Duration::from_millis(250));
        assert_eq!(config.gateway.url, "http://gateway:4000/graphql");
        assert_eq!(
            config.ack_policy,
            AckPolicy::RetryThenDeadLetter { max_attempts: 3 }
        );
    }

    #[test]
    fn test_consumer_name_is_stable() {
        let lookup = lookup_from(&[("RELAY_CONSUMER_NAME", "relay-a"), ("HOSTNAME", "pod-7")]);
        let first = RelayConfig::from_lookup(&lookup).unwrap();
        let second = RelayConfig::from_lookup(&lookup).unwrap();

        assert_eq!(first.broker.consumer_name, "relay-a");
        assert_eq!(second.broker.consumer_name, "relay-a");
    }

    #[test]
    fn test_consumer_name_from_hostname() {
        let config = RelayConfig::from_lookup(lookup_from(&[("HOSTNAME", "pod-7")])).unwrap();
        assert_eq!(config.broker.consumer_name, "event-relay-pod-7");
    }

    #[test]
    fn test_read_deadline_follows_heartbeat() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("BROKER_HEARTBEAT", "5"),
            ("BROKER_CONNECTION_TIMEOUT", "2"),
            ("BROKER_CLAIM_IDLE", "30"),
        ]))
        .unwrap();

        assert_eq!(config.supervisor.read_deadline, Duration::from_secs(7));
        assert_eq!(config.broker.claim_idle, Duration::from_secs(30));
    }

    #[test]
    fn test_config_rejects_empty_consumer_name() {
        let err =
            RelayConfig::from_lookup(lookup_from(&[("RELAY_CONSUMER_NAME", "")])).unwrap_err();
        assert!(matches!(err, RelayError::Config(msg) if msg.contains("RELAY_CONSUMER_NAME")));
    }

    #[test]
    fn test_config_rejects_bad_number() {
        let err = RelayConfig::from_lookup(lookup_from(&[("BROKER_PORT", "sixty")])).unwrap_err();
        assert!(matches!(err, RelayError::Config(msg) if msg.contains("BROKER_PORT")));
    }

    #[test]
    fn test_config_rejects_unknown_policy() {
        let err =
            RelayConfig::from_lookup(lookup_from(&[("RELAY_ACK_POLICY", "yolo")])).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_config_rejects_empty_queue() {
        let err = RelayConfig::from_lookup(lookup_from(&[("QUEUE_NAME", "")])).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
