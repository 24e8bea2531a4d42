//! Window finalization driver.

use std::sync::mpsc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{debug, info, warn};

use meterflow_core::Clock;
use meterflow_events::{RetryPolicy, StreamBus, publish_with_retry};
use meterflow_metering::{FinalizedUsage, Watermark};

use crate::stores::{StoreError, WindowStore};

use super::consumer::WorkerHandle;

/// Result of one finalization tick.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FinalizeStats {
    pub finalized: usize,
    /// Rows left open for the next tick after a publish or write failure.
    pub failed: usize,
}

/// Periodically advances the watermark and freezes expired windows.
///
/// Publish-then-persist: the finalized payload goes to the stream before
/// the row's `is_final` flag is stored, so a failure at either step leaves
/// the row listed for the next tick. The downstream sink is keyed by
/// aggregation id, making the inevitable duplicate publish harmless.
#[derive(Debug)]
pub struct WatermarkDriver<S, B, C> {
    store: S,
    usage_bus: B,
    clock: C,
    allowed_lateness: Duration,
    retry: RetryPolicy,
}

impl<S, B, C> WatermarkDriver<S, B, C>
where
    S: WindowStore + Send + Sync + 'static,
    B: StreamBus<FinalizedUsage> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        usage_bus: B,
        clock: C,
        allowed_lateness: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            usage_bus,
            clock,
            allowed_lateness,
            retry,
        }
    }

    /// One finalization tick. Exposed for tests and manual drains.
    pub fn run_once(&self) -> Result<FinalizeStats, StoreError> {
        let watermark = Watermark::derive(self.clock.now(), self.allowed_lateness);
        let expired = self.store.list_expired(watermark)?;

        let mut stats = FinalizeStats::default();
        for mut row in expired {
            let aggregation_id = row.aggregation_id();
            row.finalize(self.clock.now());

            let payload = FinalizedUsage::from_aggregate(&row);
            if let Err(err) = publish_with_retry(&self.usage_bus, payload, self.retry) {
                warn!(%aggregation_id, error = %err, "finalized usage publish failed, retrying next tick");
                stats.failed += 1;
                continue;
            }

            match self.store.update(&row) {
                Ok(()) => {
                    debug!(%aggregation_id, window = %row.window(), "window finalized");
                    stats.finalized += 1;
                }
                Err(StoreError::Conflict(reason)) => {
                    // A fold slipped in after the listing; the next tick
                    // picks the row up again with its newer value.
                    debug!(%aggregation_id, %reason, "finalize lost a version race");
                    stats.failed += 1;
                }
                Err(err) => {
                    warn!(%aggregation_id, error = %err, "finalize write failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.finalized > 0 {
            info!(
                watermark = %watermark,
                finalized = stats.finalized,
                failed = stats.failed,
                "watermark tick complete"
            );
        }
        Ok(stats)
    }

    /// Run the driver on a timer until shutdown.
    pub fn spawn(self, name: &'static str, interval: StdDuration) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(err) = self.run_once() {
                                warn!(worker = name, error = %err, "watermark tick failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn watermark driver thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryWindowStore;
    use chrono::{TimeZone, Utc};
    use meterflow_core::{CustomerId, EventId, ManualClock, TimeWindow};
    use meterflow_events::InMemoryStreamBus;
    use meterflow_metering::{AggregatedUsage, WindowKey};
    use meterflow_telemetry::{MetricType, TelemetryEvent};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn driver_with(
        store: Arc<InMemoryWindowStore>,
        bus: Arc<InMemoryStreamBus<FinalizedUsage>>,
        clock: Arc<ManualClock>,
    ) -> WatermarkDriver<
        Arc<InMemoryWindowStore>,
        Arc<InMemoryStreamBus<FinalizedUsage>>,
        Arc<ManualClock>,
    > {
        WatermarkDriver::new(store, bus, clock, Duration::hours(1), RetryPolicy::no_retry())
    }

    fn seeded_row(store: &InMemoryWindowStore, start: chrono::DateTime<Utc>, value: i64) -> WindowKey {
        let customer = CustomerId::new();
        let window = TimeWindow::new(start, start + Duration::hours(1)).unwrap();
        let key = WindowKey::new(customer, MetricType::ApiCalls, window);

        let (mut row, _) = store
            .get_or_create(&key, AggregatedUsage::open(key.clone(), start))
            .unwrap();
        let ev = TelemetryEvent::new(EventId::new(), MetricType::ApiCalls, customer, start, "test")
            .with_value(Decimal::from(value));
        row.fold(&ev, start).unwrap();
        store.update(&row).unwrap();
        key
    }

    #[test]
    fn expired_windows_freeze_and_publish() {
        let store = Arc::new(InMemoryWindowStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let sub = bus.subscribe();

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let key = seeded_row(&store, start, 8);

        // Watermark has not reached the window end yet.
        let clock = Arc::new(ManualClock::at(start + Duration::hours(1)));
        let driver = driver_with(store.clone(), bus.clone(), clock.clone());
        assert_eq!(driver.run_once().unwrap(), FinalizeStats::default());
        assert!(sub.try_recv().is_err());

        // Advance past window end + lateness: the row freezes.
        clock.set(start + Duration::hours(2));
        let stats = driver.run_once().unwrap();
        assert_eq!(stats.finalized, 1);

        let payload = sub.try_recv().unwrap();
        assert_eq!(payload.value, Decimal::from(8));
        assert_eq!(payload.window_start, key.window.start());
        assert!(payload.is_final);
        assert_eq!(payload.event_count, 1);

        // The stored row is frozen too, and the next tick is a no-op.
        assert_eq!(driver.run_once().unwrap(), FinalizeStats::default());
    }

    #[test]
    fn each_tick_finalizes_everything_expired() {
        let store = Arc::new(InMemoryWindowStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        seeded_row(&store, start, 1);
        seeded_row(&store, start, 2);
        seeded_row(&store, start + Duration::hours(1), 3);

        let clock = Arc::new(ManualClock::at(start + Duration::hours(3)));
        let driver = driver_with(store, bus, clock);
        assert_eq!(driver.run_once().unwrap().finalized, 3);
    }
}
