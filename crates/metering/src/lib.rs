//! Event-time windowed aggregation: partial aggregates, watermarking,
//! finalization.

pub mod aggregate;
pub mod finalized;
pub mod watermark;

pub use aggregate::{AggregatedUsage, FoldOutcome, WindowKey};
pub use finalized::FinalizedUsage;
pub use watermark::Watermark;
