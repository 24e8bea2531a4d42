//! Rated charges.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterflow_core::{
    AggregationId, ChargeId, CustomerId, EventId, PriceBookId, PriceRuleId, ReratingJobId,
};
use meterflow_telemetry::MetricType;

/// One tier's slice of a graduated calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBreakdown {
    pub tier: u32,
    pub units: Decimal,
    pub unit_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat_fee: Option<Decimal>,
    /// Money-scale charge for this tier.
    pub charge: Decimal,
}

/// Explainability record persisted with every charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationMetadata {
    /// Human-readable rendering of the arithmetic.
    pub formula: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers_applied: Vec<TierBreakdown>,
    /// Contributing event ids, when the aggregation supplied them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_events: Vec<EventId>,
    pub effective_date: DateTime<Utc>,
}

/// A priced line, immutable once issued.
///
/// Snapshots the price book version and rule id so later catalog edits do
/// not rewrite history. Corrections never mutate a charge; they append a
/// new one linked through `supersedes_charge_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedCharge {
    pub charge_id: ChargeId,
    pub customer_id: CustomerId,
    /// Denormalized from the rule so correction lookups need no join.
    pub metric: MetricType,
    /// Absent for delta charges produced by the late path.
    pub aggregation_id: Option<AggregationId>,
    pub price_book_id: PriceBookId,
    /// Book version at rating time.
    pub price_version: u32,
    pub rule_id: PriceRuleId,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub currency: String,
    pub calculation_metadata: CalculationMetadata,
    pub calculated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerating_job_id: Option<ReratingJobId>,
    /// Head of this charge's correction lineage, when it amends a prior one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_charge_id: Option<ChargeId>,
}

impl RatedCharge {
    pub fn is_delta(&self) -> bool {
        self.rerating_job_id.is_some()
    }
}
