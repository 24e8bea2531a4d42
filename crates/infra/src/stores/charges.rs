//! Rated charge persistence and the invoice-subsystem query surface.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use meterflow_core::{ChargeId, CustomerId, TimeWindow};
use meterflow_pricing::RatedCharge;
use meterflow_telemetry::MetricType;

use super::StoreError;

/// Immutable charge sink, keyed by charge id.
pub trait ChargeStore: Send + Sync {
    /// Insert a charge. Re-inserting the same id is a no-op (the sink is
    /// idempotent so producers may retry publishes freely).
    fn insert(&self, charge: &RatedCharge) -> Result<(), StoreError>;

    fn get(&self, charge_id: ChargeId) -> Result<Option<RatedCharge>, StoreError>;

    /// Charges whose effective date falls in `[start, end)`, ordered by
    /// `calculated_at` ascending. This is the interface the invoice
    /// subsystem consumes.
    fn find_charges_for_period(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RatedCharge>, StoreError>;

    /// Latest charge (by `calculated_at`) whose effective date falls inside
    /// the window, used to link corrections into a supersedes lineage.
    fn latest_for_window(
        &self,
        customer_id: CustomerId,
        metric: &MetricType,
        window: TimeWindow,
    ) -> Result<Option<RatedCharge>, StoreError>;
}

impl<S> ChargeStore for Arc<S>
where
    S: ChargeStore + ?Sized,
{
    fn insert(&self, charge: &RatedCharge) -> Result<(), StoreError> {
        (**self).insert(charge)
    }

    fn get(&self, charge_id: ChargeId) -> Result<Option<RatedCharge>, StoreError> {
        (**self).get(charge_id)
    }

    fn find_charges_for_period(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RatedCharge>, StoreError> {
        (**self).find_charges_for_period(customer_id, start, end)
    }

    fn latest_for_window(
        &self,
        customer_id: CustomerId,
        metric: &MetricType,
        window: TimeWindow,
    ) -> Result<Option<RatedCharge>, StoreError> {
        (**self).latest_for_window(customer_id, metric, window)
    }
}

/// In-memory charge store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryChargeStore {
    charges: RwLock<HashMap<ChargeId, RatedCharge>>,
}

impl InMemoryChargeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.charges.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }
}

impl ChargeStore for InMemoryChargeStore {
    fn insert(&self, charge: &RatedCharge) -> Result<(), StoreError> {
        let mut charges = self.charges.write().map_err(|_| Self::poisoned())?;
        charges.entry(charge.charge_id).or_insert_with(|| charge.clone());
        Ok(())
    }

    fn get(&self, charge_id: ChargeId) -> Result<Option<RatedCharge>, StoreError> {
        let charges = self.charges.read().map_err(|_| Self::poisoned())?;
        Ok(charges.get(&charge_id).cloned())
    }

    fn find_charges_for_period(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RatedCharge>, StoreError> {
        let charges = self.charges.read().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<_> = charges
            .values()
            .filter(|c| {
                c.customer_id == customer_id
                    && c.calculation_metadata.effective_date >= start
                    && c.calculation_metadata.effective_date < end
            })
            .cloned()
            .collect();
        matching.sort_by_key(|c| (c.calculated_at, c.charge_id.as_uuid().as_u128()));
        Ok(matching)
    }

    fn latest_for_window(
        &self,
        customer_id: CustomerId,
        metric: &MetricType,
        window: TimeWindow,
    ) -> Result<Option<RatedCharge>, StoreError> {
        let charges = self.charges.read().map_err(|_| Self::poisoned())?;
        Ok(charges
            .values()
            .filter(|c| {
                c.customer_id == customer_id
                    && c.metric == *metric
                    && window.contains(c.calculation_metadata.effective_date)
            })
            .max_by_key(|c| (c.calculated_at, c.charge_id.as_uuid().as_u128()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use meterflow_core::{AggregationId, PriceBookId, PriceRuleId};
    use meterflow_pricing::CalculationMetadata;
    use rust_decimal::Decimal;

    fn charge_at(
        customer: CustomerId,
        effective: DateTime<Utc>,
        calculated: DateTime<Utc>,
    ) -> RatedCharge {
        RatedCharge {
            charge_id: ChargeId::new(),
            customer_id: customer,
            metric: MetricType::ApiCalls,
            aggregation_id: Some(AggregationId::new()),
            price_book_id: PriceBookId::new(),
            price_version: 1,
            rule_id: PriceRuleId::new(),
            quantity: Decimal::ONE,
            unit_price: Decimal::ONE,
            subtotal: Decimal::ONE,
            currency: "USD".to_string(),
            calculation_metadata: CalculationMetadata {
                formula: "1 * 1".to_string(),
                tiers_applied: vec![],
                source_events: vec![],
                effective_date: effective,
            },
            calculated_at: calculated,
            rerating_job_id: None,
            supersedes_charge_id: None,
        }
    }

    #[test]
    fn period_query_filters_and_orders() {
        let store = InMemoryChargeStore::new();
        let customer = CustomerId::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let late_issued = charge_at(customer, t0 + Duration::hours(1), t0 + Duration::days(2));
        let early_issued = charge_at(customer, t0 + Duration::hours(2), t0 + Duration::days(1));
        let outside = charge_at(customer, t0 + Duration::days(40), t0 + Duration::days(40));
        let other_customer = charge_at(CustomerId::new(), t0 + Duration::hours(1), t0);

        for c in [&late_issued, &early_issued, &outside, &other_customer] {
            store.insert(c).unwrap();
        }

        let found = store
            .find_charges_for_period(customer, t0, t0 + Duration::days(30))
            .unwrap();
        assert_eq!(found.len(), 2);
        // Ordered by calculated_at ascending.
        assert_eq!(found[0].charge_id, early_issued.charge_id);
        assert_eq!(found[1].charge_id, late_issued.charge_id);
    }

    #[test]
    fn insert_is_idempotent_on_charge_id() {
        let store = InMemoryChargeStore::new();
        let c = charge_at(CustomerId::new(), Utc::now(), Utc::now());

        store.insert(&c).unwrap();
        store.insert(&c).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn latest_for_window_picks_the_newest_matching_charge() {
        let store = InMemoryChargeStore::new();
        let customer = CustomerId::new();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::hours(1)).unwrap();

        let original = charge_at(customer, start, start + Duration::hours(2));
        let correction = charge_at(customer, start + Duration::minutes(5), start + Duration::hours(5));
        store.insert(&original).unwrap();
        store.insert(&correction).unwrap();

        let latest = store
            .latest_for_window(customer, &MetricType::ApiCalls, window)
            .unwrap()
            .unwrap();
        assert_eq!(latest.charge_id, correction.charge_id);

        // No match for a different metric.
        assert!(
            store
                .latest_for_window(customer, &MetricType::ComputeHours, window)
                .unwrap()
                .is_none()
        );
    }
}
