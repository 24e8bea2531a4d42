//! Store traits and in-memory implementations.
//!
//! Traits are synchronous and storage-agnostic; the in-memory versions back
//! tests and dev, the Postgres versions live in [`crate::postgres`].

mod catalog;
mod charges;
mod telemetry;
mod window;

pub use catalog::{InMemoryPriceCatalog, PriceCatalogStore};
pub use charges::{ChargeStore, InMemoryChargeStore};
pub use telemetry::{InMemoryTelemetryStore, TelemetryEventStore};
pub use window::{InMemoryWindowStore, WindowStore};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Version-CAS failed; reload and retry.
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    #[error("record not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Storage(String),
}
