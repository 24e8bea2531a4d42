//! Finalized-usage stream payload.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterflow_core::{AggregationId, CustomerId, EventId, ReratingJobId};
use meterflow_events::Partitioned;
use meterflow_telemetry::{MetricType, Unit};

use crate::aggregate::AggregatedUsage;

/// Payload published to the aggregated-usage topic when a window freezes.
///
/// Downstream sinks key on `aggregation_id`, so re-publishing after a
/// failed tick is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedUsage {
    pub aggregation_id: AggregationId,
    pub customer_id: CustomerId,
    pub metric_type: MetricType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: Decimal,
    pub unit: Unit,
    pub event_count: u64,
    pub is_final: bool,
    /// Contributing events, carried into rating metadata.
    pub source_events: Vec<EventId>,
    /// Set on superseding correction aggregates; their usage is already
    /// billed through delta charges, so the rater must not price them
    /// again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerating_job_id: Option<ReratingJobId>,
}

impl FinalizedUsage {
    pub fn from_aggregate(aggregate: &AggregatedUsage) -> Self {
        Self {
            aggregation_id: aggregate.aggregation_id(),
            customer_id: aggregate.customer_id(),
            metric_type: aggregate.metric().clone(),
            window_start: aggregate.window().start(),
            window_end: aggregate.window().end(),
            value: aggregate.value(),
            unit: aggregate.unit(),
            event_count: aggregate.event_count(),
            is_final: aggregate.is_final(),
            source_events: aggregate.event_ids().collect(),
            rerating_job_id: aggregate.rerating_job_id().cloned(),
        }
    }
}

impl Partitioned for FinalizedUsage {
    fn partition_key(&self) -> CustomerId {
        self.customer_id
    }
}
