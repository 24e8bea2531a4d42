//! Rating hot-path benchmarks.

use chrono::{TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rust_decimal::Decimal;

use meterflow_core::{AggregationId, CustomerId, PriceBookId, PriceRuleId};
use meterflow_pricing::{PriceBook, PriceRule, PricingModel, RatingRequest, Tier, rate};
use meterflow_telemetry::{MetricType, Unit};

fn fixture() -> (PriceBook, PriceRule) {
    let book = PriceBook {
        price_book_id: PriceBookId::new(),
        name: "bench".to_string(),
        version: 1,
        effective_from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        effective_until: None,
        currency: "USD".to_string(),
        parent_id: None,
    };

    // Ten graduated tiers, the worst realistic walk.
    let tiers = (1..=10)
        .map(|n| Tier {
            tier: n,
            up_to: (n < 10).then(|| Decimal::from(n as i64 * 10_000)),
            unit_price: Decimal::new(110_000 - n as i64 * 10_000, 6),
            flat_fee: None,
        })
        .collect();

    let rule = PriceRule {
        rule_id: PriceRuleId::new(),
        price_book_id: book.price_book_id,
        metric: MetricType::ApiCalls,
        pricing_model: PricingModel::Tiered,
        tiers,
        unit: Unit::Count,
    };

    (book, rule)
}

fn bench_tiered_rating(c: &mut Criterion) {
    let (book, rule) = fixture();
    let when = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let request = RatingRequest {
        aggregation_id: Some(AggregationId::new()),
        customer_id: CustomerId::new(),
        metric: MetricType::ApiCalls,
        quantity: Decimal::from(95_000),
        effective_date: when,
        source_events: vec![],
        rerating_job_id: None,
        supersedes_charge_id: None,
    };

    c.bench_function("tiered_rating_ten_tiers", |b| {
        b.iter(|| {
            let charge = rate(
                black_box(&book),
                black_box(&rule),
                black_box(&request),
                when,
            )
            .unwrap();
            black_box(charge.subtotal);
        })
    });
}

criterion_group!(benches, bench_tiered_rating);
criterion_main!(benches);
