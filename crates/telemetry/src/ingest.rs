//! Ingest acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meterflow_core::EventId;

/// Returned to the producer once an event is durably accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub event_id: EventId,
    pub ingestion_time: DateTime<Utc>,
}
