//! Telemetry event model and metric tables.

pub mod event;
pub mod ingest;
pub mod metric;

pub use event::TelemetryEvent;
pub use ingest::IngestReceipt;
pub use metric::{AggregationFn, MetricType, Unit};
