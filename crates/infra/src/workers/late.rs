//! Late-event re-rating worker.

use chrono::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use meterflow_core::{ChargeId, Clock, DomainError, ReratingJobId, TimeWindow};
use meterflow_events::{
    LateEnvelope, PublishError, RetryPolicy, StreamBus, publish_with_retry,
};
use meterflow_metering::{AggregatedUsage, FoldOutcome, WindowKey};
use meterflow_pricing::{RatedCharge, RatingError, delta_request, rate};
use meterflow_telemetry::TelemetryEvent;

use crate::stores::{ChargeStore, PriceCatalogStore, StoreError, WindowStore};

use super::consumer::{ConsumerWorker, WorkerHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LateOutcome {
    /// Delta charge issued; carries the superseded charge when one existed.
    Delta {
        charge_id: ChargeId,
        supersedes: Option<ChargeId>,
    },
    /// The event is already in the correction row's event set; billing it
    /// again would double-charge.
    AlreadyCorrected,
    /// No effective book or rule for the event's metric.
    SkippedUnpriced,
}

#[derive(Debug, Error)]
pub enum LateWorkerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rating(#[from] RatingError),

    #[error("delta charge publish failed: {0}")]
    Publish(PublishError),

    /// The correction row lost `attempts` version races; the charge is
    /// issued but the row does not record the event.
    #[error("correction row lost {attempts} version races")]
    CasExhausted { attempts: u32 },
}

/// Re-rates events that missed their window as additive delta charges.
///
/// Each billed window a correction touches gets a re-rating job, and the
/// job owns a superseding `AggregatedUsage` row that coexists with the
/// finalized original (only the job id tells them apart). The row's event
/// set is what makes redelivered late events bill once; the historical
/// aggregate itself is never rewritten. Charges link to the latest prior
/// charge for the same `(customer, metric, window)` through the supersedes
/// lineage, which the invoice subsystem follows to produce a correction
/// invoice.
#[derive(Debug)]
pub struct LateEventProcessor<P, CS, W, B, C> {
    catalog: P,
    charges: CS,
    windows: W,
    charges_bus: B,
    clock: C,
    window_size: Duration,
    max_cas_retries: u32,
    retry: RetryPolicy,
}

impl<P, CS, W, B, C> LateEventProcessor<P, CS, W, B, C>
where
    P: PriceCatalogStore,
    CS: ChargeStore,
    W: WindowStore,
    B: StreamBus<RatedCharge>,
    C: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: P,
        charges: CS,
        windows: W,
        charges_bus: B,
        clock: C,
        window_size: Duration,
        max_cas_retries: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            catalog,
            charges,
            windows,
            charges_bus,
            clock,
            window_size,
            max_cas_retries,
            retry,
        }
    }

    pub fn handle(
        &self,
        envelope: &LateEnvelope<TelemetryEvent>,
    ) -> Result<LateOutcome, LateWorkerError> {
        let event = envelope.event();
        let mut request = delta_request(event, self.window_size)?;
        let job = request
            .rerating_job_id
            .clone()
            .ok_or_else(|| DomainError::invariant("delta request carries no re-rating job"))?;

        let window = TimeWindow::containing(event.event_time, self.window_size)?;
        let key = WindowKey::new(event.customer_id, event.event_type.clone(), window);

        // The job's correction row is the dedup ledger for this window.
        let (row, created) = self.windows.get_or_create(
            &key,
            AggregatedUsage::open_rerating(key.clone(), job.clone(), self.clock.now()),
        )?;
        if created {
            debug!(
                aggregation_id = %row.aggregation_id(),
                rerating_job_id = %job,
                "opened correction row"
            );
        }
        if row.contains_event(event.event_id) {
            debug!(event_id = %event.event_id, "late event already corrected");
            return Ok(LateOutcome::AlreadyCorrected);
        }

        let prior = self
            .charges
            .latest_for_window(event.customer_id, &event.event_type, window)?;
        request.supersedes_charge_id = prior.as_ref().map(|c| c.charge_id);

        let (book, rule) = match self.catalog.resolve(&event.event_type, request.effective_date)? {
            Ok(resolved) => resolved,
            Err(err @ (RatingError::NoPriceBook(_) | RatingError::NoPriceRule { .. })) => {
                warn!(
                    event_id = %event.event_id,
                    customer_id = %event.customer_id,
                    metric = %event.event_type,
                    error = %err,
                    "late event left unrated"
                );
                return Ok(LateOutcome::SkippedUnpriced);
            }
            Err(err) => return Err(err.into()),
        };

        let charge = rate(&book, &rule, &request, self.clock.now())?;
        self.charges.insert(&charge)?;
        publish_with_retry(&self.charges_bus, charge.clone(), self.retry)
            .map_err(LateWorkerError::Publish)?;

        // Record the event in the correction row after the charge is
        // durable; a crash in between costs one redundant delta at most on
        // a transport that redelivers.
        self.record_correction(&key, &job, event)?;

        info!(
            charge_id = %charge.charge_id,
            event_id = %event.event_id,
            rerating_job_id = %job,
            supersedes = ?charge.supersedes_charge_id,
            "late event re-rated as delta charge"
        );
        Ok(LateOutcome::Delta {
            charge_id: charge.charge_id,
            supersedes: charge.supersedes_charge_id,
        })
    }

    fn record_correction(
        &self,
        key: &WindowKey,
        job: &ReratingJobId,
        event: &TelemetryEvent,
    ) -> Result<(), LateWorkerError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let now = self.clock.now();
            let (mut row, _) = self.windows.get_or_create(
                key,
                AggregatedUsage::open_rerating(key.clone(), job.clone(), now),
            )?;

            if row.is_final() {
                // The watermark froze this job's row; the charge stands on
                // its own and later corrections chain through supersedes.
                debug!(rerating_job_id = %job, "correction row already frozen");
                return Ok(());
            }

            match row.fold(event, now)? {
                FoldOutcome::AlreadyApplied => return Ok(()),
                FoldOutcome::Applied => {}
            }

            match self.windows.update(&row) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(reason)) => {
                    if attempts > self.max_cas_retries {
                        return Err(LateWorkerError::CasExhausted { attempts });
                    }
                    debug!(attempts, %reason, "correction row update conflict, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn spawn<LB>(self, name: &'static str, late_bus: &LB) -> WorkerHandle
    where
        LB: StreamBus<LateEnvelope<TelemetryEvent>>,
        P: Send + Sync + 'static,
        CS: Send + Sync + 'static,
        W: Send + Sync + 'static,
        B: Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        ConsumerWorker::spawn(
            name,
            late_bus,
            move |envelope: LateEnvelope<TelemetryEvent>| {
                // Failures are logged and the message is considered
                // consumed; a dead-letter handler belongs to the transport.
                self.handle(&envelope).map(|_| ())
            },
        )
    }
}
