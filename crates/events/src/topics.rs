//! Logical topic names.
//!
//! Any partitioned log with consumer-group semantics can host these.

/// Raw telemetry, ingest → aggregator.
pub const TELEMETRY_EVENTS: &str = "telemetry-events";

/// Events past their window's admission deadline, aggregator → re-rating.
pub const TELEMETRY_EVENTS_LATE: &str = "telemetry-events-late";

/// Finalized window aggregates, watermark driver → rating / invoicing.
pub const AGGREGATED_USAGE: &str = "aggregated-usage";

/// Priced charges, rater → invoicing.
pub const RATED_CHARGES: &str = "rated-charges";

/// Consumer group of the aggregation worker pool.
pub const AGGREGATION_GROUP: &str = "aggregation-service-group";

/// Consumer group of the late-event re-rating pool.
pub const RERATING_GROUP: &str = "re-rating-group";
