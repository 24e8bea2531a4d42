//! Environment-driven pipeline configuration.

use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::warn;

use meterflow_events::RetryPolicy;
use meterflow_events::topics;

/// Storage connection parameters and pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: StdDuration,
    pub idle_timeout: StdDuration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/meterflow".to_string(),
            max_connections: 20,
            connect_timeout: StdDuration::from_secs(2),
            idle_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Stream consumer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub session_timeout: StdDuration,
    pub heartbeat_interval: StdDuration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            session_timeout: StdDuration::from_secs(30),
            heartbeat_interval: StdDuration::from_secs(3),
        }
    }
}

/// Recognized pipeline options with their defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window length (`WINDOW_SIZE_MS`, default 1 hour).
    pub window_size: Duration,
    /// Watermark lag (`ALLOWED_LATENESS_MS`, default 1 hour).
    pub allowed_lateness: Duration,
    /// Finalization tick period (`WATERMARK_INTERVAL_MS`, default 5 min).
    pub watermark_interval: StdDuration,
    /// Broker list (`KAFKA_BROKERS`, comma-separated).
    pub brokers: Vec<String>,
    /// Producer client id (`KAFKA_CLIENT_ID`).
    pub client_id: String,
    pub aggregation_group: String,
    pub rerating_group: String,
    pub storage: StorageConfig,
    pub consumer: ConsumerConfig,
    pub producer_retry: RetryPolicy,
    /// Bounded attempts for version-CAS retries on window rows.
    pub max_cas_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::hours(1),
            allowed_lateness: Duration::hours(1),
            watermark_interval: StdDuration::from_secs(300),
            brokers: vec!["localhost:9092".to_string()],
            client_id: "meterflow".to_string(),
            aggregation_group: topics::AGGREGATION_GROUP.to_string(),
            rerating_group: topics::RERATING_GROUP.to_string(),
            storage: StorageConfig::default(),
            consumer: ConsumerConfig::default(),
            producer_retry: RetryPolicy::default(),
            max_cas_retries: 5,
        }
    }
}

impl PipelineConfig {
    /// Read configuration from process environment, falling back to
    /// defaults for anything unset or unparsable (unparsable values are
    /// logged and ignored).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Testable core of [`PipelineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = parse_ms(&lookup, "WINDOW_SIZE_MS") {
            cfg.window_size = Duration::milliseconds(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "ALLOWED_LATENESS_MS") {
            cfg.allowed_lateness = Duration::milliseconds(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "WATERMARK_INTERVAL_MS") {
            cfg.watermark_interval = StdDuration::from_millis(ms as u64);
        }
        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            cfg.brokers = brokers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(id) = lookup("KAFKA_CLIENT_ID") {
            cfg.client_id = id;
        }
        if let Some(group) = lookup("AGGREGATION_GROUP_ID") {
            cfg.aggregation_group = group;
        }
        if let Some(group) = lookup("RERATING_GROUP_ID") {
            cfg.rerating_group = group;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            cfg.storage.url = url;
        }
        if let Some(n) = parse_u32(&lookup, "DATABASE_MAX_CONNECTIONS") {
            cfg.storage.max_connections = n;
        }

        cfg
    }
}

fn parse_ms(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<i64> {
    let raw = lookup(key)?;
    match raw.parse::<i64>() {
        Ok(ms) if ms > 0 => Some(ms),
        _ => {
            warn!(key, value = %raw, "ignoring unparsable duration override");
            None
        }
    }
}

fn parse_u32(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    let raw = lookup(key)?;
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value = %raw, "ignoring unparsable numeric override");
            None
        }
    }
}
