//! Event ingest: validate, dedup, persist, publish.

use thiserror::Error;
use tracing::{debug, instrument};

use meterflow_core::{Clock, DomainError, EventId};
use meterflow_events::{PublishError, RetryPolicy, StreamBus, publish_with_retry};
use meterflow_telemetry::{IngestReceipt, TelemetryEvent};

use crate::stores::{StoreError, TelemetryEventStore};

#[derive(Debug, Error)]
pub enum IngestError {
    /// The event id was already ingested; no state changed.
    #[error("duplicate event {0}")]
    DuplicateEvent(EventId),

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("storage failure: {0}")]
    Storage(StoreError),

    /// The event is persisted but not yet on the stream; a janitor may
    /// re-publish it (at-least-once after persistence).
    #[error("publish failed after persistence: {0}")]
    Publish(PublishError),
}

/// Front door of the pipeline.
///
/// Persist-then-publish: the dedup insert is the atomic admission check,
/// and only a durably stored event is offered to the stream.
#[derive(Debug)]
pub struct EventIngest<S, B, C> {
    store: S,
    bus: B,
    clock: C,
    retry: RetryPolicy,
}

impl<S, B, C> EventIngest<S, B, C>
where
    S: TelemetryEventStore,
    B: StreamBus<TelemetryEvent>,
    C: Clock,
{
    pub fn new(store: S, bus: B, clock: C, retry: RetryPolicy) -> Self {
        Self {
            store,
            bus,
            clock,
            retry,
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id, customer_id = %event.customer_id))]
    pub fn ingest(&self, mut event: TelemetryEvent) -> Result<IngestReceipt, IngestError> {
        let ingestion_time = self.clock.now();
        event.validate_event_time(ingestion_time)?;
        event.ingestion_time = Some(ingestion_time);

        match self.store.insert_new(&event) {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(IngestError::DuplicateEvent(event.event_id));
            }
            Err(e) => return Err(IngestError::Storage(e)),
        }

        let event_id = event.event_id;
        publish_with_retry(&self.bus, event, self.retry).map_err(IngestError::Publish)?;

        debug!(%event_id, "event ingested");
        Ok(IngestReceipt {
            event_id,
            ingestion_time,
        })
    }
}
