//! Stream mechanics: publish/subscribe, partitioning, producer retries.

pub mod bus;
pub mod envelope;
pub mod in_memory;
pub mod partition;
pub mod retry;
pub mod topics;

pub use bus::{StreamBus, Subscription};
pub use envelope::LateEnvelope;
pub use in_memory::{InMemoryBusError, InMemoryStreamBus};
pub use partition::Partitioned;
pub use retry::{PublishError, RetryPolicy, publish_with_retry};
