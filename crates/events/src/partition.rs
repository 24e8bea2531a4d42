//! Customer partitioning of stream messages.

use meterflow_core::CustomerId;

/// A message routed by customer.
///
/// Streams are partitioned by customer so that all operations touching the
/// same window row land on the same consumer; within one partition messages
/// are applied in stream order, across partitions there is no ordering.
pub trait Partitioned {
    fn partition_key(&self) -> CustomerId;
}
