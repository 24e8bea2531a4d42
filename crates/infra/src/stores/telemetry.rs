//! Telemetry event persistence with dedup-by-id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use meterflow_core::EventId;
use meterflow_telemetry::TelemetryEvent;

use super::StoreError;

/// Durable telemetry events, unique by event id.
///
/// The dedup check and the write are atomic with respect to concurrent
/// ingests of the same id (a unique constraint on storage suffices).
pub trait TelemetryEventStore: Send + Sync {
    /// Insert a new event; [`StoreError::Duplicate`] when the id exists.
    fn insert_new(&self, event: &TelemetryEvent) -> Result<(), StoreError>;

    fn get(&self, event_id: EventId) -> Result<Option<TelemetryEvent>, StoreError>;
}

impl<S> TelemetryEventStore for Arc<S>
where
    S: TelemetryEventStore + ?Sized,
{
    fn insert_new(&self, event: &TelemetryEvent) -> Result<(), StoreError> {
        (**self).insert_new(event)
    }

    fn get(&self, event_id: EventId) -> Result<Option<TelemetryEvent>, StoreError> {
        (**self).get(event_id)
    }
}

/// In-memory event store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTelemetryStore {
    events: RwLock<HashMap<EventId, TelemetryEvent>>,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetryEventStore for InMemoryTelemetryStore {
    fn insert_new(&self, event: &TelemetryEvent) -> Result<(), StoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        if events.contains_key(&event.event_id) {
            return Err(StoreError::Duplicate(event.event_id.to_string()));
        }
        events.insert(event.event_id, event.clone());
        Ok(())
    }

    fn get(&self, event_id: EventId) -> Result<Option<TelemetryEvent>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(events.get(&event_id).cloned())
    }
}
