//! Delta rating of late events.

use chrono::Duration;
use rust_decimal::Decimal;

use meterflow_core::{DomainError, ReratingJobId, TimeWindow};
use meterflow_telemetry::TelemetryEvent;

use crate::rater::RatingRequest;

/// Build the delta rating request for a late event.
///
/// A delta charge carries no aggregation id (it never rewrites the billed
/// aggregate) and a re-rating job id derived from the event's natural
/// window, so concurrent corrections for one period deduplicate. The
/// supersedes link is attached by the caller once the latest prior charge
/// for the window is known.
pub fn delta_request(
    event: &TelemetryEvent,
    window_size: Duration,
) -> Result<RatingRequest, DomainError> {
    let window = TimeWindow::containing(event.event_time, window_size)?;
    let quantity = event.value().unwrap_or(Decimal::ONE);

    Ok(RatingRequest {
        aggregation_id: None,
        customer_id: event.customer_id,
        metric: event.event_type.clone(),
        quantity,
        effective_date: event.event_time,
        source_events: vec![event.event_id],
        rerating_job_id: Some(ReratingJobId::derive(event.customer_id, window.start())),
        supersedes_charge_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meterflow_core::{CustomerId, EventId};
    use meterflow_telemetry::MetricType;

    #[test]
    fn delta_request_derives_job_from_the_natural_window() {
        let customer = CustomerId::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 42, 7).unwrap();
        let event = TelemetryEvent::new(EventId::new(), MetricType::ApiCalls, customer, t, "test")
            .with_value(Decimal::from(5));

        let request = delta_request(&event, Duration::hours(1)).unwrap();

        assert_eq!(request.quantity, Decimal::from(5));
        assert_eq!(request.effective_date, t);
        assert!(request.aggregation_id.is_none());

        let window_start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            request.rerating_job_id,
            Some(ReratingJobId::derive(customer, window_start))
        );
        assert_eq!(request.source_events, vec![event.event_id]);
    }

    #[test]
    fn quantity_defaults_to_one_event() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let event =
            TelemetryEvent::new(EventId::new(), MetricType::ApiCalls, CustomerId::new(), t, "test");

        let request = delta_request(&event, Duration::hours(1)).unwrap();
        assert_eq!(request.quantity, Decimal::ONE);
    }
}
