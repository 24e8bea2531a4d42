//! Event aggregation worker.

use chrono::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use meterflow_core::{AggregationId, Clock, DomainError, TimeWindow};
use meterflow_events::{
    LateEnvelope, PublishError, RetryPolicy, StreamBus, publish_with_retry,
};
use meterflow_metering::{AggregatedUsage, FoldOutcome, Watermark, WindowKey};
use meterflow_telemetry::TelemetryEvent;

use crate::stores::{StoreError, WindowStore};

use super::consumer::{ConsumerWorker, WorkerHandle};

/// What happened to one event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Folded into its window row.
    Applied(AggregationId),
    /// Redelivery of an event already folded in.
    AlreadyApplied(AggregationId),
    /// Window past the admission deadline; redirected to the late stream.
    Late,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    /// Version-CAS lost `attempts` times in a row; the message should be
    /// redelivered.
    #[error("window update lost {attempts} version races")]
    CasExhausted { attempts: u32 },

    #[error("late redirect failed: {0}")]
    LatePublish(PublishError),
}

/// Assigns events to windows and folds them into the window store.
///
/// The watermark check and the fold race freely against finalization;
/// correctness rests on the version-CAS update and on `is_final` being a
/// one-way transition. An event that loses the race against finalization
/// is redirected to the late stream like any other late arrival.
#[derive(Debug)]
pub struct Aggregator<L, S, C> {
    late_bus: L,
    store: S,
    clock: C,
    window_size: Duration,
    allowed_lateness: Duration,
    max_cas_retries: u32,
    retry: RetryPolicy,
}

impl<L, S, C> Aggregator<L, S, C>
where
    L: StreamBus<LateEnvelope<TelemetryEvent>>,
    S: WindowStore,
    C: Clock,
{
    pub fn new(
        late_bus: L,
        store: S,
        clock: C,
        window_size: Duration,
        allowed_lateness: Duration,
        max_cas_retries: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            late_bus,
            store,
            clock,
            window_size,
            allowed_lateness,
            max_cas_retries,
            retry,
        }
    }

    pub fn handle(&self, event: &TelemetryEvent) -> Result<Disposition, AggregatorError> {
        let window = TimeWindow::containing(event.event_time, self.window_size)?;
        let now = self.clock.now();
        let watermark = Watermark::derive(now, self.allowed_lateness);

        if watermark.is_late(&window) {
            return self.redirect_late(event, watermark);
        }

        let key = WindowKey::new(event.customer_id, event.event_type.clone(), window);

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let now = self.clock.now();
            let (mut row, created) = self
                .store
                .get_or_create(&key, AggregatedUsage::open(key.clone(), now))?;
            if created {
                debug!(aggregation_id = %row.aggregation_id(), window = %key.window, "opened window row");
            }

            if row.is_final() {
                // Finalization won the race; the event can no longer join
                // its natural window.
                let watermark = Watermark::derive(self.clock.now(), self.allowed_lateness);
                return self.redirect_late(event, watermark);
            }

            match row.fold(event, now)? {
                FoldOutcome::AlreadyApplied => {
                    return Ok(Disposition::AlreadyApplied(row.aggregation_id()));
                }
                FoldOutcome::Applied => {}
            }

            match self.store.update(&row) {
                Ok(()) => return Ok(Disposition::Applied(row.aggregation_id())),
                Err(StoreError::Conflict(reason)) => {
                    if attempts > self.max_cas_retries {
                        return Err(AggregatorError::CasExhausted { attempts });
                    }
                    debug!(attempts, %reason, "window update conflict, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn redirect_late(
        &self,
        event: &TelemetryEvent,
        watermark: Watermark,
    ) -> Result<Disposition, AggregatorError> {
        let received_at = self.clock.now();
        let envelope = LateEnvelope::new(event.clone(), received_at, watermark.position());

        publish_with_retry(&self.late_bus, envelope, self.retry)
            .map_err(AggregatorError::LatePublish)?;

        warn!(
            event_id = %event.event_id,
            customer_id = %event.customer_id,
            event_time = %event.event_time,
            watermark = %watermark,
            "stale event redirected to late stream"
        );
        Ok(Disposition::Late)
    }
}

/// Thread wrapper over [`Aggregator::handle`].
#[derive(Debug)]
pub struct AggregatorWorker;

impl AggregatorWorker {
    pub fn spawn<B, L, S, C>(
        name: &'static str,
        events: &B,
        aggregator: Aggregator<L, S, C>,
    ) -> WorkerHandle
    where
        B: StreamBus<TelemetryEvent>,
        L: StreamBus<LateEnvelope<TelemetryEvent>> + Send + Sync + 'static,
        S: WindowStore + Send + Sync + 'static,
        C: Clock + Send + Sync + 'static,
    {
        ConsumerWorker::spawn(name, events, move |event: TelemetryEvent| {
            aggregator.handle(&event).map(|_| ())
        })
    }

    /// Spawn a scale-out worker handling only one customer's partition.
    pub fn spawn_pinned<B, L, S, C>(
        name: &'static str,
        events: &B,
        aggregator: Aggregator<L, S, C>,
        customer_id: meterflow_core::CustomerId,
    ) -> WorkerHandle
    where
        B: StreamBus<TelemetryEvent>,
        L: StreamBus<LateEnvelope<TelemetryEvent>> + Send + Sync + 'static,
        S: WindowStore + Send + Sync + 'static,
        C: Clock + Send + Sync + 'static,
    {
        ConsumerWorker::spawn_pinned(name, events, customer_id, move |event: TelemetryEvent| {
            aggregator.handle(&event).map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryWindowStore;
    use chrono::{TimeZone, Utc};
    use meterflow_core::{CustomerId, EventId, ManualClock};
    use meterflow_events::InMemoryStreamBus;
    use meterflow_telemetry::MetricType;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    type TestAggregator = Aggregator<
        Arc<InMemoryStreamBus<LateEnvelope<TelemetryEvent>>>,
        Arc<InMemoryWindowStore>,
        Arc<ManualClock>,
    >;

    fn setup() -> (
        Arc<InMemoryStreamBus<LateEnvelope<TelemetryEvent>>>,
        Arc<InMemoryWindowStore>,
        Arc<ManualClock>,
        TestAggregator,
    ) {
        let late = Arc::new(InMemoryStreamBus::new());
        let store = Arc::new(InMemoryWindowStore::new());
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap(),
        ));
        let aggregator = Aggregator::new(
            late.clone(),
            store.clone(),
            clock.clone(),
            Duration::hours(1),
            Duration::hours(1),
            5,
            RetryPolicy::no_retry(),
        );
        (late, store, clock, aggregator)
    }

    fn event(customer: CustomerId, t: chrono::DateTime<Utc>, value: i64) -> TelemetryEvent {
        TelemetryEvent::new(EventId::new(), MetricType::ApiCalls, customer, t, "test")
            .with_value(Decimal::from(value))
    }

    #[test]
    fn in_window_events_fold_into_one_row() {
        let (_late, store, clock, aggregator) = setup();
        let customer = CustomerId::new();

        let id = match aggregator.handle(&event(customer, clock.now(), 1)).unwrap() {
            Disposition::Applied(id) => id,
            other => panic!("expected Applied, got {other:?}"),
        };
        aggregator
            .handle(&event(customer, clock.now() + Duration::seconds(10), 5))
            .unwrap();
        aggregator
            .handle(&event(customer, clock.now() + Duration::seconds(20), 2))
            .unwrap();

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.value(), Decimal::from(8));
        assert_eq!(row.event_count(), 3);
        assert!(!row.is_final());
    }

    #[test]
    fn redelivered_events_do_not_double_count() {
        let (_late, store, clock, aggregator) = setup();
        let customer = CustomerId::new();
        let ev = event(customer, clock.now(), 5);

        let id = match aggregator.handle(&ev).unwrap() {
            Disposition::Applied(id) => id,
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(
            aggregator.handle(&ev).unwrap(),
            Disposition::AlreadyApplied(id)
        );

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.value(), Decimal::from(5));
        assert_eq!(row.event_count(), 1);
    }

    #[test]
    fn stale_events_go_to_the_late_stream_with_the_watermark() {
        let (late, store, clock, aggregator) = setup();
        let sub = late.subscribe();
        let customer = CustomerId::new();

        // A day-old event against a one-hour lateness allowance.
        let stale = event(customer, clock.now() - Duration::hours(24), 3);
        assert_eq!(aggregator.handle(&stale).unwrap(), Disposition::Late);

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.event().event_id, stale.event_id);
        assert_eq!(envelope.received_at(), clock.now());
        assert_eq!(envelope.watermark(), clock.now() - Duration::hours(1));

        // No aggregate touched.
        let wm = Watermark::at(clock.now() + Duration::days(365));
        assert!(store.list_expired(wm).unwrap().is_empty());
    }

    #[test]
    fn events_losing_the_finalization_race_are_redirected() {
        let (late, store, clock, aggregator) = setup();
        let sub = late.subscribe();
        let customer = CustomerId::new();

        let first = event(customer, clock.now(), 1);
        let id = match aggregator.handle(&first).unwrap() {
            Disposition::Applied(id) => id,
            other => panic!("expected Applied, got {other:?}"),
        };

        // Freeze the row out from under the next event.
        let mut row = store.get(id).unwrap().unwrap();
        store.finalize(&mut row, clock.now()).unwrap();

        let racer = event(customer, clock.now() + Duration::seconds(1), 9);
        assert_eq!(aggregator.handle(&racer).unwrap(), Disposition::Late);
        assert_eq!(sub.try_recv().unwrap().event().event_id, racer.event_id);

        // The frozen value is untouched.
        let frozen = store.get(id).unwrap().unwrap();
        assert_eq!(frozen.value(), Decimal::from(1));
    }
}
