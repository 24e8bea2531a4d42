//! Infrastructure: stores, workers, ingest, pipeline wiring.
//!
//! Domain crates stay IO-free; everything that touches storage, streams or
//! threads lives here.

pub mod config;
pub mod ingest;
pub mod pipeline;
pub mod postgres;
pub mod stores;
pub mod stream_bus;
pub mod workers;


pub use config::{ConsumerConfig, PipelineConfig, StorageConfig};
pub use ingest::{EventIngest, IngestError};
pub use pipeline::{Pipeline, PipelineHandles};
