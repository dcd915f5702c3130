//! Runtime configuration.
//!
//! Every section has sensible defaults and can be overridden from the
//! environment (`EVENTIDE_*`, durations in milliseconds). Sections read through
//! a lookup function so tests can feed values without touching the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Lookup of a single configuration key.
pub trait Lookup: Fn(&str) -> Option<String> {}
impl<F: Fn(&str) -> Option<String>> Lookup for F {}

fn parse_or<T: FromStr>(lookup: &impl Lookup, key: &str, default: T) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn millis_or(lookup: &impl Lookup, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn non_zero<T: PartialEq + Default + ToString>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Event store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStoreConfig {
    /// Postgres URL; `None` means the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
        }
    }
}

impl EventStoreConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            database_url: lookup("EVENTIDE_DATABASE_URL").or(d.database_url),
            max_connections: non_zero(
                "EVENTIDE_DB_MAX_CONNECTIONS",
                parse_or(&lookup, "EVENTIDE_DB_MAX_CONNECTIONS", d.max_connections)?,
            )?,
        })
    }
}

/// Outbox worker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Failed attempts after which a record is dead-lettered.
    pub dlq_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Poll interval multiplier applied after a loop-level failure.
    pub error_backoff_multiplier: u32,
    /// `processing` rows older than this are considered abandoned and reclaimed.
    pub claim_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            dlq_threshold: 5,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(60_000),
            error_backoff_multiplier: 5,
            claim_timeout: Duration::from_millis(300_000),
        }
    }
}

impl OutboxConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            poll_interval: millis_or(&lookup, "EVENTIDE_OUTBOX_POLL_INTERVAL_MS", d.poll_interval)?,
            batch_size: non_zero(
                "EVENTIDE_OUTBOX_BATCH_SIZE",
                parse_or(&lookup, "EVENTIDE_OUTBOX_BATCH_SIZE", d.batch_size)?,
            )?,
            dlq_threshold: non_zero(
                "EVENTIDE_OUTBOX_DLQ_THRESHOLD",
                parse_or(&lookup, "EVENTIDE_OUTBOX_DLQ_THRESHOLD", d.dlq_threshold)?,
            )?,
            base_backoff: millis_or(&lookup, "EVENTIDE_OUTBOX_BASE_BACKOFF_MS", d.base_backoff)?,
            max_backoff: millis_or(&lookup, "EVENTIDE_OUTBOX_MAX_BACKOFF_MS", d.max_backoff)?,
            error_backoff_multiplier: parse_or(
                &lookup,
                "EVENTIDE_OUTBOX_ERROR_BACKOFF_MULTIPLIER",
                d.error_backoff_multiplier,
            )?,
            claim_timeout: millis_or(&lookup, "EVENTIDE_OUTBOX_CLAIM_TIMEOUT_MS", d.claim_timeout)?,
        })
    }

    /// Delay before the next attempt of a record that has failed `retry_count` times.
    ///
    /// `min(base_backoff * 2^retry_count, max_backoff)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Sleep after a loop-level error (claim or status update failed).
    pub fn error_backoff(&self) -> Duration {
        self.poll_interval
            .checked_mul(self.error_backoff_multiplier.max(1))
            .unwrap_or(self.max_backoff)
    }
}

/// Snapshot policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot every `threshold` versions.
    pub threshold: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { threshold: 100 }
    }
}

impl SnapshotConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            threshold: non_zero(
                "EVENTIDE_SNAPSHOT_THRESHOLD",
                parse_or(&lookup, "EVENTIDE_SNAPSHOT_THRESHOLD", Self::default().threshold)?,
            )?,
        })
    }
}

/// Replay batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub batch_size: usize,
    /// Log a checkpoint every N processed events.
    pub checkpoint_interval: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            checkpoint_interval: 1000,
        }
    }
}

impl ReplayConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            batch_size: non_zero(
                "EVENTIDE_REPLAY_BATCH_SIZE",
                parse_or(&lookup, "EVENTIDE_REPLAY_BATCH_SIZE", d.batch_size)?,
            )?,
            checkpoint_interval: non_zero(
                "EVENTIDE_REPLAY_CHECKPOINT_INTERVAL",
                parse_or(&lookup, "EVENTIDE_REPLAY_CHECKPOINT_INTERVAL", d.checkpoint_interval)?,
            )?,
        })
    }
}

/// Broker connection and topic names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub brokers: String,
    pub client_id: String,
    pub group_id: String,
    pub send_timeout: Duration,
    pub accounting_topic: String,
    pub inventory_topic: String,
    pub audit_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "eventide".to_string(),
            group_id: "eventide-consumers".to_string(),
            send_timeout: Duration::from_millis(5000),
            accounting_topic: "accounting.events.v1".to_string(),
            inventory_topic: "inventory.events.v1".to_string(),
            audit_topic: "audit.events.v1".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            brokers: lookup("EVENTIDE_KAFKA_BROKERS").unwrap_or(d.brokers),
            client_id: lookup("EVENTIDE_KAFKA_CLIENT_ID").unwrap_or(d.client_id),
            group_id: lookup("EVENTIDE_KAFKA_GROUP_ID").unwrap_or(d.group_id),
            send_timeout: millis_or(&lookup, "EVENTIDE_KAFKA_SEND_TIMEOUT_MS", d.send_timeout)?,
            accounting_topic: lookup("EVENTIDE_TOPIC_ACCOUNTING").unwrap_or(d.accounting_topic),
            inventory_topic: lookup("EVENTIDE_TOPIC_INVENTORY").unwrap_or(d.inventory_topic),
            audit_topic: lookup("EVENTIDE_TOPIC_AUDIT").unwrap_or(d.audit_topic),
        })
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub event_store: EventStoreConfig,
    pub outbox: OutboxConfig,
    pub snapshot: SnapshotConfig,
    pub replay: ReplayConfig,
    pub broker: BrokerConfig,
}

impl RuntimeConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            event_store: EventStoreConfig::from_lookup(&lookup)?,
            outbox: OutboxConfig::from_lookup(&lookup)?,
            snapshot: SnapshotConfig::from_lookup(&lookup)?,
            replay: ReplayConfig::from_lookup(&lookup)?,
            broker: BrokerConfig::from_lookup(&lookup)?,
        })
    }

    /// Read configuration from `EVENTIDE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key: &str| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.outbox.poll_interval, Duration::from_secs(1));
        assert_eq!(config.outbox.dlq_threshold, 5);
        assert_eq!(config.snapshot.threshold, 100);
        assert_eq!(config.replay.batch_size, 500);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("EVENTIDE_OUTBOX_POLL_INTERVAL_MS", "250"),
            ("EVENTIDE_OUTBOX_DLQ_THRESHOLD", "3"),
            ("EVENTIDE_DATABASE_URL", "postgres://localhost/erp"),
            ("EVENTIDE_TOPIC_AUDIT", "audit.events.v2"),
        ]))
        .unwrap();

        assert_eq!(config.outbox.poll_interval, Duration::from_millis(250));
        assert_eq!(config.outbox.dlq_threshold, 3);
        assert_eq!(config.event_store.database_url.as_deref(), Some("postgres://localhost/erp"));
        assert_eq!(config.broker.audit_topic, "audit.events.v2");
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = OutboxConfig::from_lookup(lookup(&[("EVENTIDE_OUTBOX_BATCH_SIZE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "EVENTIDE_OUTBOX_BATCH_SIZE".to_string(),
                value: "lots".to_string(),
            }
        );
        assert!(SnapshotConfig::from_lookup(lookup(&[("EVENTIDE_SNAPSHOT_THRESHOLD", "0")])).is_err());
    }

    #[test]
    fn retry_delay_doubles_until_capped() {
        let config = OutboxConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(3), Duration::from_secs(8));
        assert_eq!(config.retry_delay(10), Duration::from_secs(60));
        assert_eq!(config.retry_delay(64), Duration::from_secs(60));
        assert_eq!(config.error_backoff(), Duration::from_secs(5));
    }
}
