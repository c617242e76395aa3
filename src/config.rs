//! Publisher configuration.
//!
//! [`PublisherConfig`] is plain data: it deserializes from any `serde` source
//! (durations are expressed in milliseconds) and every field has a default, so
//! a partial document only overrides what it names.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{backoff::Backoff, queue::RetryOrdering, spool::RetentionPolicy, spool::fs};

pub const DEFAULT_BROKER_ADDRESS: &str = "amqp://127.0.0.1:5672/%2f";
pub const DEFAULT_HEARTBEAT_DESTINATION: &str = "aorta.heartbeat";

/// Settings for the publisher engine and its background tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub broker_address: String,
    pub spool_path: PathBuf,
    /// Attempts before an envelope is marked failed.
    pub max_attempts: u32,
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    #[serde(rename = "backoff_cap_ms", with = "millis")]
    pub backoff_cap: Duration,
    pub backoff_jitter: bool,
    /// Bound on both connecting and waiting for a broker acknowledgment.
    #[serde(rename = "ack_timeout_ms", with = "millis")]
    pub ack_timeout: Duration,
    /// Largest accepted payload, in bytes.
    pub max_payload_size: usize,
    /// Concurrent drain workers, each owning one broker connection.
    pub drain_workers: usize,
    pub retry_ordering: RetryOrdering,
    /// How often the spool is rescanned for records written by other
    /// processes.
    #[serde(rename = "intake_interval_ms", with = "millis")]
    pub intake_interval: Duration,
    pub heartbeat: HeartbeatConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    pub destination: String,
    /// Consecutive failed heartbeat attempts that trigger a reconnect.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Delivered records older than this are swept.
    #[serde(rename = "delivered_horizon_ms", with = "millis")]
    pub delivered_horizon: Duration,
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            broker_address: DEFAULT_BROKER_ADDRESS.to_owned(),
            spool_path: PathBuf::from(fs::DEFAULT_SPOOL_DIR),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: true,
            ack_timeout: Duration::from_secs(10),
            max_payload_size: 1024 * 1024,
            drain_workers: 1,
            retry_ordering: RetryOrdering::default(),
            intake_interval: Duration::from_secs(1),
            heartbeat: HeartbeatConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            destination: DEFAULT_HEARTBEAT_DESTINATION.to_owned(),
            failure_threshold: 5,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            delivered_horizon: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl PublisherConfig {
    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.broker_address = address.into();
        self
    }

    pub fn with_spool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spool_path = path.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_backoff_jitter(mut self, jitter: bool) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_drain_workers(mut self, workers: usize) -> Self {
        self.drain_workers = workers;
        self
    }

    pub fn with_retry_ordering(mut self, ordering: RetryOrdering) -> Self {
        self.retry_ordering = ordering;
        self
    }

    pub fn with_intake_interval(mut self, interval: Duration) -> Self {
        self.intake_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_cap).with_jitter(self.backoff_jitter)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.retention.delivered_horizon)
    }

    /// Check the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.trim().is_empty() {
            return Err(ConfigError::invalid("broker_address", "must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.drain_workers == 0 {
            return Err(ConfigError::invalid("drain_workers", "must be at least 1"));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::invalid(
                "backoff_base_ms",
                "must not exceed backoff_cap_ms",
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::invalid("ack_timeout_ms", "must be positive"));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::invalid("max_payload_size", "must be positive"));
        }
        if self.intake_interval.is_zero() {
            return Err(ConfigError::invalid("intake_interval_ms", "must be positive"));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat.interval_ms", "must be positive"));
        }
        if self.heartbeat.destination.trim().is_empty() {
            return Err(ConfigError::invalid(
                "heartbeat.destination",
                "must not be empty",
            ));
        }
        if self.heartbeat.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "heartbeat.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.retention.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "retention.sweep_interval_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Error returned when a configuration cannot be used.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A field holds a value outside its accepted range.
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid { field, reason },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::Invalid { field, reason } => {
                writeln!(f, "Invalid configuration: `{field}` {reason}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PublisherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.spool_path, PathBuf::from("/var/spool/aorta"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.heartbeat.failure_threshold, 5);
        assert_eq!(config.retry_ordering, RetryOrdering::Requeue);
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config: PublisherConfig = serde_json::from_str(
            r#"{
                "max_attempts": 3,
                "backoff_base_ms": 250,
                "retry_ordering": "hold_destination",
                "intake_interval_ms": 250,
                "heartbeat": { "interval_ms": 1000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.backoff_cap, Duration::from_secs(60));
        assert_eq!(config.retry_ordering, RetryOrdering::HoldDestination);
        assert_eq!(config.intake_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat.destination, DEFAULT_HEARTBEAT_DESTINATION);
    }

    #[test]
    fn rejects_unusable_values() {
        let cases = [
            (PublisherConfig::default().with_max_attempts(0), "max_attempts"),
            (PublisherConfig::default().with_drain_workers(0), "drain_workers"),
            (
                PublisherConfig::default().with_intake_interval(Duration::ZERO),
                "intake_interval_ms",
            ),
            (
                PublisherConfig::default()
                    .with_backoff(Duration::from_secs(2), Duration::from_secs(1)),
                "backoff_base_ms",
            ),
            (
                PublisherConfig::default().with_heartbeat(HeartbeatConfig {
                    destination: " ".into(),
                    ..Default::default()
                }),
                "heartbeat.destination",
            ),
            (
                PublisherConfig::default().with_retention(RetentionConfig {
                    sweep_interval: Duration::ZERO,
                    ..Default::default()
                }),
                "retention.sweep_interval_ms",
            ),
        ];

        for (config, expected) in cases {
            let err = config.validate().unwrap_err();
            let ConfigErrorKind::Invalid { field, .. } = err.kind();
            assert_eq!(*field, expected);
        }
    }
}
