//! The rating engine.
//!
//! Pure with respect to its inputs: the same `(book snapshot, rule,
//! quantity, effective date)` always produces the identical subtotal and
//! metadata. Correction invoices depend on this determinism.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use meterflow_core::decimal::{round_money, round_price, round_quantity};
use meterflow_core::{
    AggregationId, ChargeId, CustomerId, EventId, PriceBookId, ReratingJobId,
};
use meterflow_telemetry::MetricType;

use crate::catalog::{PriceBook, PriceRule, PricingModel, Tier};
use crate::charge::{CalculationMetadata, RatedCharge, TierBreakdown};

/// Request to price one quantity of one metric at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingRequest {
    /// Absent for delta ratings on the late path.
    pub aggregation_id: Option<AggregationId>,
    pub customer_id: CustomerId,
    pub metric: MetricType,
    pub quantity: Decimal,
    pub effective_date: DateTime<Utc>,
    /// Contributing events, carried into the charge metadata.
    pub source_events: Vec<EventId>,
    pub rerating_job_id: Option<ReratingJobId>,
    pub supersedes_charge_id: Option<ChargeId>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RatingError {
    #[error("no price book effective at {0}")]
    NoPriceBook(DateTime<Utc>),

    #[error("no price rule for metric {metric} in book {book}")]
    NoPriceRule { book: PriceBookId, metric: MetricType },

    #[error("invalid price rule: {0}")]
    InvalidRule(String),
}

/// Resolve the effective book and its rule for a metric.
pub fn resolve<'a>(
    books: impl IntoIterator<Item = &'a PriceBook>,
    rules: impl IntoIterator<Item = &'a PriceRule>,
    metric: &MetricType,
    at: DateTime<Utc>,
) -> Result<(&'a PriceBook, &'a PriceRule), RatingError> {
    let book = PriceBook::resolve_effective(books, at).ok_or(RatingError::NoPriceBook(at))?;
    let rule = rules
        .into_iter()
        .find(|r| r.price_book_id == book.price_book_id && r.metric == *metric)
        .ok_or_else(|| RatingError::NoPriceRule {
            book: book.price_book_id,
            metric: metric.clone(),
        })?;
    Ok((book, rule))
}

/// Price a request against a resolved book + rule.
///
/// Money is rounded half-up to 2 decimals at the subtotal (and per tier in
/// the breakdown); intermediate products carry full precision.
pub fn rate(
    book: &PriceBook,
    rule: &PriceRule,
    request: &RatingRequest,
    calculated_at: DateTime<Utc>,
) -> Result<RatedCharge, RatingError> {
    if rule.price_book_id != book.price_book_id {
        return Err(RatingError::InvalidRule(
            "rule does not belong to the resolved book".to_string(),
        ));
    }
    if rule.metric != request.metric {
        return Err(RatingError::InvalidRule(format!(
            "rule is for {}, request is for {}",
            rule.metric, request.metric
        )));
    }
    rule.validate()
        .map_err(|e| RatingError::InvalidRule(e.to_string()))?;

    let quantity = round_quantity(request.quantity);
    let priced = match rule.pricing_model {
        PricingModel::Flat => price_flat(rule),
        PricingModel::PerUnit | PricingModel::Committed => price_per_unit(rule, quantity),
        PricingModel::Tiered => price_tiered(rule, quantity),
        PricingModel::Volume => price_volume(rule, quantity)?,
    };

    Ok(RatedCharge {
        charge_id: ChargeId::new(),
        customer_id: request.customer_id,
        metric: rule.metric.clone(),
        aggregation_id: request.aggregation_id,
        price_book_id: book.price_book_id,
        price_version: book.version,
        rule_id: rule.rule_id,
        quantity,
        unit_price: round_price(priced.unit_price),
        subtotal: round_money(priced.total),
        currency: book.currency.clone(),
        calculation_metadata: CalculationMetadata {
            formula: priced.formula,
            tiers_applied: priced.tiers_applied,
            source_events: request.source_events.clone(),
            effective_date: request.effective_date,
        },
        calculated_at,
        rerating_job_id: request.rerating_job_id.clone(),
        supersedes_charge_id: request.supersedes_charge_id,
    })
}

struct Priced {
    total: Decimal,
    unit_price: Decimal,
    formula: String,
    tiers_applied: Vec<TierBreakdown>,
}

fn price_flat(rule: &PriceRule) -> Priced {
    let price = rule.tiers[0].unit_price;
    Priced {
        total: price,
        unit_price: price,
        formula: display(price),
        tiers_applied: Vec::new(),
    }
}

fn price_per_unit(rule: &PriceRule, quantity: Decimal) -> Priced {
    let price = rule.tiers[0].unit_price;
    Priced {
        total: quantity * price,
        unit_price: price,
        formula: format!("{} * {}", display(quantity), display(price)),
        tiers_applied: Vec::new(),
    }
}

/// Graduated pricing: each tier charges its own slice of the quantity.
fn price_tiered(rule: &PriceRule, quantity: Decimal) -> Priced {
    let mut remaining = quantity;
    let mut previous_limit = Decimal::ZERO;
    let mut total = Decimal::ZERO;
    let mut tiers_applied = Vec::new();
    let mut terms = Vec::new();

    for tier in &rule.tiers {
        if remaining <= Decimal::ZERO {
            break;
        }

        let units = match tier.up_to {
            Some(limit) => remaining.min(limit - previous_limit),
            None => remaining,
        };
        if let Some(limit) = tier.up_to {
            previous_limit = limit;
        }
        if units <= Decimal::ZERO {
            continue;
        }

        let fee = tier.flat_fee.unwrap_or(Decimal::ZERO);
        let tier_total = units * tier.unit_price + fee;

        terms.push(render_term(units, tier.unit_price, tier.flat_fee));
        tiers_applied.push(TierBreakdown {
            tier: tier.tier,
            units,
            unit_price: tier.unit_price,
            flat_fee: tier.flat_fee,
            charge: round_money(tier_total),
        });

        total += tier_total;
        remaining -= units;
    }

    let unit_price = tiers_applied
        .last()
        .map(|t| t.unit_price)
        .unwrap_or(rule.tiers[0].unit_price);

    Priced {
        total,
        unit_price,
        formula: if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join(" + ")
        },
        tiers_applied,
    }
}

/// Volume pricing: the single tier covering the quantity prices all of it.
fn price_volume(rule: &PriceRule, quantity: Decimal) -> Result<Priced, RatingError> {
    let tier = tier_for_volume(&rule.tiers, quantity).ok_or_else(|| {
        RatingError::InvalidRule(format!(
            "no tier covers quantity {}",
            display(quantity)
        ))
    })?;

    let fee = tier.flat_fee.unwrap_or(Decimal::ZERO);
    let total = quantity * tier.unit_price + fee;

    Ok(Priced {
        total,
        unit_price: tier.unit_price,
        formula: render_term(quantity, tier.unit_price, tier.flat_fee),
        tiers_applied: vec![TierBreakdown {
            tier: tier.tier,
            units: quantity,
            unit_price: tier.unit_price,
            flat_fee: tier.flat_fee,
            charge: round_money(total),
        }],
    })
}

fn tier_for_volume(tiers: &[Tier], quantity: Decimal) -> Option<&Tier> {
    tiers
        .iter()
        .find(|t| t.up_to.is_none_or(|limit| limit >= quantity))
}

fn render_term(units: Decimal, unit_price: Decimal, flat_fee: Option<Decimal>) -> String {
    match flat_fee {
        Some(fee) if !fee.is_zero() => format!(
            "{} * {} + {}",
            display(units),
            display(unit_price),
            display(fee)
        ),
        _ => format!("{} * {}", display(units), display(unit_price)),
    }
}

fn display(value: Decimal) -> String {
    value.normalize().to_string()
}
