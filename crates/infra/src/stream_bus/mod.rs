//! Durable stream transports.
//!
//! The in-memory bus in `meterflow-events` covers dev and tests; this
//! module holds transports with real delivery guarantees.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamBus, RedisStreamError, RedisTopics};
