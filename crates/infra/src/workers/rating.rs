//! Rating worker: finalized aggregates → rated charges.

use thiserror::Error;
use tracing::{debug, warn};

use meterflow_core::{ChargeId, Clock};
use meterflow_events::{PublishError, RetryPolicy, StreamBus, publish_with_retry};
use meterflow_metering::FinalizedUsage;
use meterflow_pricing::{RatedCharge, RatingError, RatingRequest, rate};

use crate::stores::{ChargeStore, PriceCatalogStore, StoreError};

use super::consumer::{ConsumerWorker, WorkerHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RatingOutcome {
    Charged(ChargeId),
    /// No effective book or rule; the aggregate stays final so a catalog
    /// fix allows a manual retry.
    SkippedUnpriced,
    /// Superseding correction aggregate: its events were billed as delta
    /// charges when they arrived, so pricing it again would double-bill.
    SkippedCorrection,
}

#[derive(Debug, Error)]
pub enum RatingWorkerError {
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rating(#[from] RatingError),

    #[error("charge publish failed: {0}")]
    Publish(PublishError),
}

/// Prices finalized usage against the effective catalog.
///
/// The charge's effective date is the window start: usage is priced at the
/// time it occurred, exactly as the late path prices deltas, so original
/// and correction charges stay comparable.
#[derive(Debug)]
pub struct RatingWorker<P, CS, B, C> {
    catalog: P,
    charges: CS,
    charges_bus: B,
    clock: C,
    retry: RetryPolicy,
}

impl<P, CS, B, C> RatingWorker<P, CS, B, C>
where
    P: PriceCatalogStore,
    CS: ChargeStore,
    B: StreamBus<RatedCharge>,
    C: Clock,
{
    pub fn new(catalog: P, charges: CS, charges_bus: B, clock: C, retry: RetryPolicy) -> Self {
        Self {
            catalog,
            charges,
            charges_bus,
            clock,
            retry,
        }
    }

    pub fn handle(&self, usage: &FinalizedUsage) -> Result<RatingOutcome, RatingWorkerError> {
        if let Some(job) = &usage.rerating_job_id {
            debug!(
                aggregation_id = %usage.aggregation_id,
                rerating_job_id = %job,
                "correction aggregate already billed through deltas"
            );
            return Ok(RatingOutcome::SkippedCorrection);
        }

        let effective_date = usage.window_start;

        let (book, rule) = match self.catalog.resolve(&usage.metric_type, effective_date)? {
            Ok(resolved) => resolved,
            Err(err @ (RatingError::NoPriceBook(_) | RatingError::NoPriceRule { .. })) => {
                warn!(
                    aggregation_id = %usage.aggregation_id,
                    customer_id = %usage.customer_id,
                    metric = %usage.metric_type,
                    error = %err,
                    "aggregate left unrated"
                );
                return Ok(RatingOutcome::SkippedUnpriced);
            }
            Err(err) => return Err(err.into()),
        };

        let request = RatingRequest {
            aggregation_id: Some(usage.aggregation_id),
            customer_id: usage.customer_id,
            metric: usage.metric_type.clone(),
            quantity: usage.value,
            effective_date,
            source_events: usage.source_events.clone(),
            rerating_job_id: None,
            supersedes_charge_id: None,
        };

        let charge = rate(&book, &rule, &request, self.clock.now())?;
        self.charges.insert(&charge)?;
        publish_with_retry(&self.charges_bus, charge.clone(), self.retry)
            .map_err(RatingWorkerError::Publish)?;

        debug!(
            charge_id = %charge.charge_id,
            aggregation_id = %usage.aggregation_id,
            subtotal = %charge.subtotal,
            "aggregate rated"
        );
        Ok(RatingOutcome::Charged(charge.charge_id))
    }

    pub fn spawn<UB>(self, name: &'static str, usage_bus: &UB) -> WorkerHandle
    where
        UB: StreamBus<FinalizedUsage>,
        P: Send + Sync + 'static,
        CS: Send + Sync + 'static,
        B: Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        ConsumerWorker::spawn(name, usage_bus, move |usage: FinalizedUsage| {
            self.handle(&usage).map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{InMemoryChargeStore, InMemoryPriceCatalog};
    use chrono::{Duration, TimeZone, Utc};
    use meterflow_core::{
        AggregationId, CustomerId, EventId, ManualClock, PriceBookId, PriceRuleId,
    };
    use meterflow_events::InMemoryStreamBus;
    use meterflow_pricing::{PriceBook, PriceRule, PricingModel, Tier};
    use meterflow_telemetry::{MetricType, Unit};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn catalog_with_tiered_api_calls() -> Arc<InMemoryPriceCatalog> {
        let catalog = Arc::new(InMemoryPriceCatalog::new());
        let book = PriceBook {
            price_book_id: PriceBookId::new(),
            name: "standard".to_string(),
            version: 2,
            effective_from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            effective_until: None,
            currency: "USD".to_string(),
            parent_id: None,
        };
        let rule = PriceRule {
            rule_id: PriceRuleId::new(),
            price_book_id: book.price_book_id,
            metric: MetricType::ApiCalls,
            pricing_model: PricingModel::Tiered,
            tiers: vec![
                Tier {
                    tier: 1,
                    up_to: Some(Decimal::from(1000)),
                    unit_price: Decimal::new(100_000, 6),
                    flat_fee: None,
                },
                Tier {
                    tier: 2,
                    up_to: None,
                    unit_price: Decimal::new(50_000, 6),
                    flat_fee: None,
                },
            ],
            unit: Unit::Count,
        };
        catalog.add_book(book).unwrap();
        catalog.add_rule(rule).unwrap();
        catalog
    }

    fn usage(value: i64) -> FinalizedUsage {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        FinalizedUsage {
            aggregation_id: AggregationId::new(),
            customer_id: CustomerId::new(),
            metric_type: MetricType::ApiCalls,
            window_start: start,
            window_end: start + Duration::hours(1),
            value: Decimal::from(value),
            unit: Unit::Count,
            event_count: 3,
            is_final: true,
            source_events: vec![EventId::new(), EventId::new(), EventId::new()],
            rerating_job_id: None,
        }
    }

    fn worker(
        catalog: Arc<InMemoryPriceCatalog>,
        charges: Arc<InMemoryChargeStore>,
        bus: Arc<InMemoryStreamBus<RatedCharge>>,
    ) -> RatingWorker<
        Arc<InMemoryPriceCatalog>,
        Arc<InMemoryChargeStore>,
        Arc<InMemoryStreamBus<RatedCharge>>,
        Arc<ManualClock>,
    > {
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        RatingWorker::new(catalog, charges, bus, clock, RetryPolicy::no_retry())
    }

    #[test]
    fn finalized_usage_becomes_a_persisted_published_charge() {
        let charges = Arc::new(InMemoryChargeStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let sub = bus.subscribe();
        let worker = worker(catalog_with_tiered_api_calls(), charges.clone(), bus.clone());

        let usage = usage(1200);
        let outcome = worker.handle(&usage).unwrap();

        let charge_id = match outcome {
            RatingOutcome::Charged(id) => id,
            other => panic!("expected Charged, got {other:?}"),
        };

        let stored = charges.get(charge_id).unwrap().unwrap();
        assert_eq!(stored.subtotal, Decimal::new(11000, 2)); // 110.00
        assert_eq!(stored.aggregation_id, Some(usage.aggregation_id));
        assert_eq!(stored.price_version, 2);
        assert_eq!(stored.calculation_metadata.source_events, usage.source_events);
        assert_eq!(
            stored.calculation_metadata.effective_date,
            usage.window_start
        );

        let published = sub.try_recv().unwrap();
        assert_eq!(published.charge_id, charge_id);
    }

    #[test]
    fn unpriced_metrics_are_skipped_not_fatal() {
        let charges = Arc::new(InMemoryChargeStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let worker = worker(catalog_with_tiered_api_calls(), charges.clone(), bus);

        let mut usage = usage(10);
        usage.metric_type = MetricType::ComputeHours;

        assert_eq!(
            worker.handle(&usage).unwrap(),
            RatingOutcome::SkippedUnpriced
        );
        assert!(charges.is_empty());
    }

    #[test]
    fn correction_aggregates_are_not_priced_again() {
        let charges = Arc::new(InMemoryChargeStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let worker = worker(catalog_with_tiered_api_calls(), charges.clone(), bus);

        let mut usage = usage(50);
        usage.rerating_job_id = Some(meterflow_core::ReratingJobId::derive(
            usage.customer_id,
            usage.window_start,
        ));

        assert_eq!(
            worker.handle(&usage).unwrap(),
            RatingOutcome::SkippedCorrection
        );
        assert!(charges.is_empty());
    }

    #[test]
    fn rating_without_any_book_is_skipped() {
        let charges = Arc::new(InMemoryChargeStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let worker = worker(Arc::new(InMemoryPriceCatalog::new()), charges.clone(), bus);

        assert_eq!(
            worker.handle(&usage(10)).unwrap(),
            RatingOutcome::SkippedUnpriced
        );
        assert!(charges.is_empty());
    }
}
