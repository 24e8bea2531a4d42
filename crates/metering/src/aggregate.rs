//! Windowed usage aggregates.
//!
//! One row per `(customer, metric, window)` accumulates events until the
//! watermark passes the window end, then freezes. The contributing event-id
//! set makes re-application idempotent under at-least-once delivery.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterflow_core::{
    AggregationId, CustomerId, DomainError, EventId, ReratingJobId, TimeWindow, Versioned,
};
use meterflow_telemetry::{AggregationFn, MetricType, TelemetryEvent, Unit};

/// Identity of a window row: `(customer, metric, window)`.
///
/// Unique among non-final rows without a re-rating job; a superseding
/// aggregation created by a re-rating job may coexist with the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub customer_id: CustomerId,
    pub metric: MetricType,
    pub window: TimeWindow,
}

impl WindowKey {
    pub fn new(customer_id: CustomerId, metric: MetricType, window: TimeWindow) -> Self {
        Self {
            customer_id,
            metric,
            window,
        }
    }
}

/// Result of folding one event into a window row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// The event changed the aggregate.
    Applied,
    /// The event id was already folded in; nothing changed.
    AlreadyApplied,
}

/// Partial (or finalized) aggregate for one window.
///
/// Mutable while `is_final == false`; immutable after. The `version` column
/// is the optimistic lock the aggregator and the watermark driver serialize
/// through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUsage {
    aggregation_id: AggregationId,
    customer_id: CustomerId,
    metric: MetricType,
    window: TimeWindow,
    value: Decimal,
    unit: Unit,
    event_ids: BTreeSet<EventId>,
    is_final: bool,
    version: u64,
    computed_at: DateTime<Utc>,
    rerating_job_id: Option<ReratingJobId>,
}

impl AggregatedUsage {
    /// Seed an empty row for a window (created on the first event).
    pub fn open(key: WindowKey, now: DateTime<Utc>) -> Self {
        let unit = key.metric.unit();
        Self {
            aggregation_id: AggregationId::new(),
            customer_id: key.customer_id,
            metric: key.metric,
            window: key.window,
            value: Decimal::ZERO,
            unit,
            event_ids: BTreeSet::new(),
            is_final: false,
            version: 0,
            computed_at: now,
            rerating_job_id: None,
        }
    }

    /// Seed the superseding row a re-rating job accumulates late events
    /// into. It coexists with the finalized original for the same window;
    /// only the job id distinguishes them.
    pub fn open_rerating(key: WindowKey, job_id: ReratingJobId, now: DateTime<Utc>) -> Self {
        let mut row = Self::open(key, now);
        row.rerating_job_id = Some(job_id);
        row
    }

    /// Rehydrate a row from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        aggregation_id: AggregationId,
        key: WindowKey,
        value: Decimal,
        unit: Unit,
        event_ids: BTreeSet<EventId>,
        is_final: bool,
        version: u64,
        computed_at: DateTime<Utc>,
        rerating_job_id: Option<ReratingJobId>,
    ) -> Result<Self, DomainError> {
        if value < Decimal::ZERO {
            return Err(DomainError::invariant("aggregate value must be non-negative"));
        }
        Ok(Self {
            aggregation_id,
            customer_id: key.customer_id,
            metric: key.metric,
            window: key.window,
            value,
            unit,
            event_ids,
            is_final,
            version,
            computed_at,
            rerating_job_id,
        })
    }

    pub fn aggregation_id(&self) -> AggregationId {
        self.aggregation_id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn metric(&self) -> &MetricType {
        &self.metric
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.customer_id, self.metric.clone(), self.window)
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Invariant: equals the size of the contributing event-id set.
    pub fn event_count(&self) -> u64 {
        self.event_ids.len() as u64
    }

    pub fn event_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.event_ids.iter().copied()
    }

    pub fn contains_event(&self, event_id: EventId) -> bool {
        self.event_ids.contains(&event_id)
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn rerating_job_id(&self) -> Option<&ReratingJobId> {
        self.rerating_job_id.as_ref()
    }

    /// Fold one event into the aggregate.
    ///
    /// Idempotent: an event id already present is skipped, which makes
    /// redelivery safe. Fails if the row is finalized or the event does not
    /// belong to this row's key.
    pub fn fold(
        &mut self,
        event: &TelemetryEvent,
        now: DateTime<Utc>,
    ) -> Result<FoldOutcome, DomainError> {
        if self.is_final {
            return Err(DomainError::frozen(format!(
                "window {} no longer accepts events",
                self.window
            )));
        }
        if event.customer_id != self.customer_id {
            return Err(DomainError::validation("event customer does not match window"));
        }
        if event.event_type != self.metric {
            return Err(DomainError::validation("event metric does not match window"));
        }
        if !self.window.contains(event.event_time) {
            return Err(DomainError::validation(format!(
                "event_time {} outside window {}",
                event.event_time, self.window
            )));
        }

        if self.event_ids.contains(&event.event_id) {
            return Ok(FoldOutcome::AlreadyApplied);
        }

        let next = match self.metric.aggregation() {
            AggregationFn::Sum => {
                // Addend defaults to 1 for pure counting metrics.
                let addend = event.value().unwrap_or(Decimal::ONE);
                self.value + addend
            }
            AggregationFn::Max => {
                // Peaks without a value contribute the floor.
                let candidate = event.value().unwrap_or(Decimal::ZERO);
                self.value.max(candidate)
            }
        };

        if next < Decimal::ZERO {
            return Err(DomainError::invariant(
                "aggregate value must remain non-negative",
            ));
        }

        self.value = next;
        self.event_ids.insert(event.event_id);
        self.computed_at = now;
        self.version += 1;

        Ok(FoldOutcome::Applied)
    }

    /// One-way transition to the immutable state.
    ///
    /// Returns `false` when the row was already final (safe to re-run; the
    /// watermark driver may retry after a failed publish).
    pub fn finalize(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_final {
            return false;
        }
        self.is_final = true;
        self.computed_at = now;
        self.version += 1;
        true
    }
}

impl Versioned for AggregatedUsage {
    type Id = AggregationId;

    fn id(&self) -> &Self::Id {
        &self.aggregation_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn window_at(hour: u32) -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
        TimeWindow::new(start, start + Duration::hours(1)).unwrap()
    }

    fn key(customer: CustomerId, metric: MetricType) -> WindowKey {
        WindowKey::new(customer, metric, window_at(10))
    }

    fn event_at(
        customer: CustomerId,
        metric: MetricType,
        offset_secs: i64,
        value: Option<i64>,
    ) -> TelemetryEvent {
        let t = window_at(10).start() + Duration::seconds(offset_secs);
        let ev = TelemetryEvent::new(EventId::new(), metric, customer, t, "test");
        match value {
            Some(v) => ev.with_value(Decimal::from(v)),
            None => ev,
        }
    }

    #[test]
    fn sum_accumulates_values_and_defaults_to_one() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());

        for (offset, v) in [(0, Some(1)), (10, Some(5)), (20, Some(2)), (30, None)] {
            let ev = event_at(customer, MetricType::ApiCalls, offset, v);
            assert_eq!(agg.fold(&ev, Utc::now()).unwrap(), FoldOutcome::Applied);
        }

        assert_eq!(agg.value(), Decimal::from(9)); // 1 + 5 + 2 + 1
        assert_eq!(agg.event_count(), 4);
        assert_eq!(agg.unit(), Unit::Count);
        assert_eq!(agg.version(), 4);
    }

    #[test]
    fn max_tracks_the_peak() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::StorageGbPeak), Utc::now());

        for (offset, v) in [(0, 30), (10, 50), (20, 40)] {
            let ev = event_at(customer, MetricType::StorageGbPeak, offset, Some(v));
            agg.fold(&ev, Utc::now()).unwrap();
        }

        assert_eq!(agg.value(), Decimal::from(50));
        assert_eq!(agg.event_count(), 3);
    }

    #[test]
    fn max_without_value_contributes_zero() {
        let customer = CustomerId::new();
        let mut agg =
            AggregatedUsage::open(key(customer, MetricType::ConcurrentUsersMax), Utc::now());

        let ev = event_at(customer, MetricType::ConcurrentUsersMax, 0, None);
        agg.fold(&ev, Utc::now()).unwrap();
        assert_eq!(agg.value(), Decimal::ZERO);
    }

    #[test]
    fn redelivery_is_idempotent() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());

        let ev = event_at(customer, MetricType::ApiCalls, 0, Some(5));
        assert_eq!(agg.fold(&ev, Utc::now()).unwrap(), FoldOutcome::Applied);
        let version = agg.version();

        assert_eq!(
            agg.fold(&ev, Utc::now()).unwrap(),
            FoldOutcome::AlreadyApplied
        );
        assert_eq!(agg.value(), Decimal::from(5));
        assert_eq!(agg.event_count(), 1);
        assert_eq!(agg.version(), version);
    }

    #[test]
    fn finalize_is_one_way_and_freezes_the_row() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());
        agg.fold(
            &event_at(customer, MetricType::ApiCalls, 0, Some(3)),
            Utc::now(),
        )
        .unwrap();

        assert!(agg.finalize(Utc::now()));
        assert!(!agg.finalize(Utc::now()));
        assert!(agg.is_final());

        let err = agg
            .fold(
                &event_at(customer, MetricType::ApiCalls, 10, Some(1)),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::FrozenAggregate(_)));
        assert_eq!(agg.value(), Decimal::from(3));
    }

    #[test]
    fn events_outside_the_key_are_rejected() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());

        // Wrong customer.
        let ev = event_at(CustomerId::new(), MetricType::ApiCalls, 0, Some(1));
        assert!(agg.fold(&ev, Utc::now()).is_err());

        // Wrong metric.
        let ev = event_at(customer, MetricType::BandwidthMb, 0, Some(1));
        assert!(agg.fold(&ev, Utc::now()).is_err());

        // Wrong window.
        let t = window_at(12).start();
        let ev = TelemetryEvent::new(EventId::new(), MetricType::ApiCalls, customer, t, "test");
        assert!(agg.fold(&ev, Utc::now()).is_err());
    }

    #[test]
    fn rerating_rows_carry_their_job_and_fold_normally() {
        let customer = CustomerId::new();
        let key = key(customer, MetricType::ApiCalls);
        let job = ReratingJobId::derive(customer, key.window.start());
        let mut agg = AggregatedUsage::open_rerating(key, job.clone(), Utc::now());

        assert_eq!(agg.rerating_job_id(), Some(&job));

        let ev = event_at(customer, MetricType::ApiCalls, 40, Some(2));
        agg.fold(&ev, Utc::now()).unwrap();
        assert_eq!(agg.value(), Decimal::from(2));

        // Redelivered corrections are no-ops, same as the on-time path.
        assert_eq!(
            agg.fold(&ev, Utc::now()).unwrap(),
            FoldOutcome::AlreadyApplied
        );
    }

    #[test]
    fn negative_sums_violate_the_floor() {
        let customer = CustomerId::new();
        let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());

        let ev = event_at(customer, MetricType::ApiCalls, 0, Some(-5));
        assert!(agg.fold(&ev, Utc::now()).is_err());
        assert_eq!(agg.value(), Decimal::ZERO);
        assert_eq!(agg.event_count(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Law: redelivering any prefix of the history again never changes
        /// the aggregate.
        #[test]
        fn folding_is_idempotent_under_redelivery(
            values in prop::collection::vec(0i64..1_000i64, 1..20),
            redeliver in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            let customer = CustomerId::new();
            let mut agg = AggregatedUsage::open(key(customer, MetricType::ApiCalls), Utc::now());

            let events: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| event_at(customer, MetricType::ApiCalls, i as i64, Some(*v)))
                .collect();

            for ev in &events {
                agg.fold(ev, Utc::now()).unwrap();
            }
            let value = agg.value();
            let count = agg.event_count();

            for idx in redeliver {
                let ev = idx.get(&events);
                prop_assert_eq!(agg.fold(ev, Utc::now()).unwrap(), FoldOutcome::AlreadyApplied);
            }

            prop_assert_eq!(agg.value(), value);
            prop_assert_eq!(agg.event_count(), count);
        }
    }
}
