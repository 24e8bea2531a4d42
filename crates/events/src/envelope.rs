//! Late-event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meterflow_core::CustomerId;

use crate::partition::Partitioned;

/// Envelope published to the late-events topic.
///
/// Wraps an event that arrived after its window's admission deadline with
/// the processing-time context needed to audit the redirect: when the
/// aggregator saw it, and where the watermark stood at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateEnvelope<E> {
    event: E,
    received_at: DateTime<Utc>,
    watermark: DateTime<Utc>,
}

impl<E> LateEnvelope<E> {
    pub fn new(event: E, received_at: DateTime<Utc>, watermark: DateTime<Utc>) -> Self {
        Self {
            event,
            received_at,
            watermark,
        }
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn into_event(self) -> E {
        self.event
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Watermark position at redirect time.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }
}

impl<E> Partitioned for LateEnvelope<E>
where
    E: Partitioned,
{
    fn partition_key(&self) -> CustomerId {
        self.event.partition_key()
    }
}
