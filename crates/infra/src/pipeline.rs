//! Pipeline bootstrap and ordered shutdown.

use std::sync::Arc;

use tracing::info;

use meterflow_core::Clock;
use meterflow_events::{InMemoryStreamBus, LateEnvelope};
use meterflow_metering::FinalizedUsage;
use meterflow_pricing::RatedCharge;
use meterflow_telemetry::TelemetryEvent;

use crate::config::PipelineConfig;
use crate::ingest::EventIngest;
use crate::stores::{
    InMemoryChargeStore, InMemoryPriceCatalog, InMemoryTelemetryStore, InMemoryWindowStore,
};
use crate::workers::{
    Aggregator, AggregatorWorker, LateEventProcessor, RatingWorker, WatermarkDriver, WorkerHandle,
};

/// The four logical topics and four stores of one pipeline instance.
///
/// In-memory everywhere: this is the dev/test stack. Production swaps the
/// buses for a durable log and the stores for their Postgres versions.
pub struct InMemoryStack {
    pub events_bus: Arc<InMemoryStreamBus<TelemetryEvent>>,
    pub late_bus: Arc<InMemoryStreamBus<LateEnvelope<TelemetryEvent>>>,
    pub usage_bus: Arc<InMemoryStreamBus<FinalizedUsage>>,
    pub charges_bus: Arc<InMemoryStreamBus<RatedCharge>>,
    pub telemetry_store: Arc<InMemoryTelemetryStore>,
    pub window_store: Arc<InMemoryWindowStore>,
    pub catalog: Arc<InMemoryPriceCatalog>,
    pub charge_store: Arc<InMemoryChargeStore>,
}

impl Default for InMemoryStack {
    fn default() -> Self {
        Self {
            events_bus: Arc::new(InMemoryStreamBus::new()),
            late_bus: Arc::new(InMemoryStreamBus::new()),
            usage_bus: Arc::new(InMemoryStreamBus::new()),
            charges_bus: Arc::new(InMemoryStreamBus::new()),
            telemetry_store: Arc::new(InMemoryTelemetryStore::new()),
            window_store: Arc::new(InMemoryWindowStore::new()),
            catalog: Arc::new(InMemoryPriceCatalog::new()),
            charge_store: Arc::new(InMemoryChargeStore::new()),
        }
    }
}

/// Handles of the running workers, shut down in dependency order.
pub struct PipelineHandles {
    watermark: WorkerHandle,
    aggregator: WorkerHandle,
    rating: WorkerHandle,
    late: WorkerHandle,
}

impl PipelineHandles {
    /// Graceful shutdown: stop the watermark timer first (no new
    /// finalizations), then the consumers, each join draining its in-flight
    /// work before the next stops.
    pub fn shutdown(self) {
        self.watermark.shutdown();
        self.aggregator.shutdown();
        self.rating.shutdown();
        self.late.shutdown();
        info!("pipeline stopped");
    }
}

/// A fully wired pipeline over the in-memory stack.
pub struct Pipeline {
    pub stack: InMemoryStack,
    pub ingest: EventIngest<
        Arc<InMemoryTelemetryStore>,
        Arc<InMemoryStreamBus<TelemetryEvent>>,
        Arc<dyn Clock>,
    >,
    handles: PipelineHandles,
}

impl Pipeline {
    /// Wire stores, buses and workers, and start all four worker threads.
    pub fn start(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let stack = InMemoryStack::default();

        let ingest = EventIngest::new(
            stack.telemetry_store.clone(),
            stack.events_bus.clone(),
            clock.clone(),
            config.producer_retry,
        );

        let aggregator = Aggregator::new(
            stack.late_bus.clone(),
            stack.window_store.clone(),
            clock.clone(),
            config.window_size,
            config.allowed_lateness,
            config.max_cas_retries,
            config.producer_retry,
        );
        let aggregator_handle =
            AggregatorWorker::spawn("aggregator", &stack.events_bus, aggregator);

        let driver = WatermarkDriver::new(
            stack.window_store.clone(),
            stack.usage_bus.clone(),
            clock.clone(),
            config.allowed_lateness,
            config.producer_retry,
        );
        let watermark_handle = driver.spawn("watermark-driver", config.watermark_interval);

        let rating = RatingWorker::new(
            stack.catalog.clone(),
            stack.charge_store.clone(),
            stack.charges_bus.clone(),
            clock.clone(),
            config.producer_retry,
        );
        let rating_handle = rating.spawn("rating", &stack.usage_bus);

        let late = LateEventProcessor::new(
            stack.catalog.clone(),
            stack.charge_store.clone(),
            stack.window_store.clone(),
            stack.charges_bus.clone(),
            clock.clone(),
            config.window_size,
            config.max_cas_retries,
            config.producer_retry,
        );
        let late_handle = late.spawn("late-rerating", &stack.late_bus);

        info!(
            window_size_ms = config.window_size.num_milliseconds(),
            allowed_lateness_ms = config.allowed_lateness.num_milliseconds(),
            watermark_interval_ms = config.watermark_interval.as_millis() as u64,
            "pipeline started"
        );

        Self {
            stack,
            ingest,
            handles: PipelineHandles {
                watermark: watermark_handle,
                aggregator: aggregator_handle,
                rating: rating_handle,
                late: late_handle,
            },
        }
    }

    pub fn shutdown(self) {
        self.handles.shutdown();
    }
}
