//! Delivery counters shared by the relay's tasks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by the publisher and the supervisor.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    publish_retries: AtomicU64,
    processed: AtomicU64,
    rejected_permanent: AtomicU64,
    rejected_transient: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    gateway_calls: AtomicU64,
    reconnects: AtomicU64,
    backoff_sleeps: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub published: u64,
    pub publish_retries: u64,
    pub processed: u64,
    pub rejected_permanent: u64,
    pub rejected_transient: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub gateway_calls: u64,
    pub reconnects: u64,
    pub backoff_sleeps: u64,
}

macro_rules! counters {
    ($($field:ident => $incr:ident),* $(,)?) => {
        impl RelayStats {
            $(
                pub fn $incr(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    published => record_published,
    publish_retries => record_publish_retry,
    processed => record_processed,
    rejected_permanent => record_rejected_permanent,
    rejected_transient => record_rejected_transient,
    requeued => record_requeued,
    dead_lettered => record_dead_lettered,
    gateway_calls => record_gateway_call,
    reconnects => record_reconnect,
    backoff_sleeps => record_backoff_sleep,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = RelayStats::default();
        stats.record_published();
        stats.record_published();
        stats.record_backoff_sleep();
        stats.record_dead_lettered();

        let snap = stats.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.backoff_sleeps, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.processed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RelayStats::default();
        stats.record_gateway_call();

        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(value["gateway_calls"], 1);
        assert_eq!(value["reconnects"], 0);
    }
}
