//! Raw telemetry events.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use meterflow_core::{CustomerId, DomainError, EventId};
use meterflow_events::Partitioned;

/// Maximum allowed skew of an event time into the future of its ingestion
/// time. Anything beyond is a malformed producer clock, not a real event.
pub fn max_future_skew() -> Duration {
    Duration::days(1)
}

/// A raw usage event, immutable once ingested.
///
/// `event_time` is the authoritative timestamp for windowing;
/// `ingestion_time` is stamped by the ingest service and is `None` until
/// then. `metadata` is opaque to the pipeline except for the optional
/// numeric `value` attribute consumed by the aggregation functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: EventId,
    /// Maps 1:1 to the metric type.
    pub event_type: crate::MetricType,
    pub customer_id: CustomerId,
    pub event_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub source: String,
}

impl TelemetryEvent {
    pub fn new(
        event_id: EventId,
        event_type: impl Into<crate::MetricType>,
        customer_id: CustomerId,
        event_time: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            customer_id,
            event_time,
            ingestion_time: None,
            metadata: Map::new(),
            source: source.into(),
        }
    }

    pub fn with_value(mut self, value: Decimal) -> Self {
        self.metadata
            .insert("value".to_string(), JsonValue::String(value.to_string()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The numeric `value` attribute, when present and parseable.
    ///
    /// JSON numbers go through their decimal string form so binary floating
    /// point never touches the aggregation path.
    pub fn value(&self) -> Option<Decimal> {
        match self.metadata.get("value") {
            Some(JsonValue::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
            Some(JsonValue::String(s)) => Decimal::from_str(s).ok(),
            _ => None,
        }
    }

    /// Sanity clamp: an event may not claim a time more than
    /// [`max_future_skew`] ahead of the moment it is ingested.
    pub fn validate_event_time(&self, ingestion_time: DateTime<Utc>) -> Result<(), DomainError> {
        let skew = max_future_skew();
        if self.event_time > ingestion_time + skew {
            return Err(DomainError::validation(format!(
                "event_time {} is more than {skew} ahead of ingestion",
                self.event_time
            )));
        }
        Ok(())
    }
}

impl Partitioned for TelemetryEvent {
    fn partition_key(&self) -> CustomerId {
        self.customer_id
    }
}
