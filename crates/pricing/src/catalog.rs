//! Price books and rules.
//!
//! A price book is a temporally-effective catalog version; rules inside it
//! bind one pricing model (with its tier table) to one metric. Catalog
//! edits never mutate history: charges snapshot the book version and rule
//! id they were priced with.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterflow_core::{DomainError, PriceBookId, PriceRuleId};
use meterflow_telemetry::{MetricType, Unit};

/// A versioned, time-effective pricing catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBook {
    pub price_book_id: PriceBookId,
    pub name: String,
    pub version: u32,
    pub effective_from: DateTime<Utc>,
    /// `None` means the effectivity is open-ended.
    pub effective_until: Option<DateTime<Utc>>,
    /// ISO 4217 code; FX is out of scope.
    pub currency: String,
    /// Links versioned successors into one chain.
    pub parent_id: Option<PriceBookId>,
}

impl PriceBook {
    /// Effectivity test: `effective_from <= t` and `effective_until > t`
    /// (or open-ended).
    pub fn is_effective_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_from <= t && self.effective_until.is_none_or(|until| until > t)
    }

    /// Resolve the book in effect at `t`: of the effective ones, the one
    /// with the latest `effective_from` wins.
    pub fn resolve_effective<'a>(
        books: impl IntoIterator<Item = &'a PriceBook>,
        t: DateTime<Utc>,
    ) -> Option<&'a PriceBook> {
        books
            .into_iter()
            .filter(|b| b.is_effective_at(t))
            .max_by_key(|b| b.effective_from)
    }
}

/// Check that effectivity intervals within each version chain do not
/// overlap.
///
/// Books belong to one chain when they are linked through `parent_id`
/// (transitively) within the given set.
pub fn validate_chains(books: &[PriceBook]) -> Result<(), DomainError> {
    for (i, a) in books.iter().enumerate() {
        for b in &books[i + 1..] {
            if !same_chain(books, a, b) {
                continue;
            }
            if intervals_overlap(a, b) {
                return Err(DomainError::invariant(format!(
                    "price books {} and {} overlap in effectivity",
                    a.price_book_id, b.price_book_id
                )));
            }
        }
    }
    Ok(())
}

fn same_chain(books: &[PriceBook], a: &PriceBook, b: &PriceBook) -> bool {
    chain_root(books, a) == chain_root(books, b)
}

/// Follow `parent_id` links within the set; bounded by the set size, so a
/// malformed parent cycle terminates.
fn chain_root(books: &[PriceBook], book: &PriceBook) -> PriceBookId {
    let mut current = book;
    for _ in 0..books.len() {
        let Some(parent_id) = current.parent_id else {
            break;
        };
        match books.iter().find(|b| b.price_book_id == parent_id) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current.price_book_id
}

fn intervals_overlap(a: &PriceBook, b: &PriceBook) -> bool {
    let a_until = a.effective_until;
    let b_until = b.effective_until;
    let a_before_b = a_until.is_some_and(|until| until <= b.effective_from);
    let b_before_a = b_until.is_some_and(|until| until <= a.effective_from);
    !(a_before_b || b_before_a)
}

/// Pricing model applied by a rule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    /// Fixed amount per period regardless of quantity.
    Flat,
    /// Single rate times quantity.
    PerUnit,
    /// Graduated: each tier prices its own slice of the quantity.
    Tiered,
    /// The single tier covering the total quantity prices all of it.
    Volume,
    /// Reserved; currently rates as per-unit.
    Committed,
}

impl PricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::Flat => "flat",
            PricingModel::PerUnit => "per_unit",
            PricingModel::Tiered => "tiered",
            PricingModel::Volume => "volume",
            PricingModel::Committed => "committed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "flat" => Some(PricingModel::Flat),
            "per_unit" => Some(PricingModel::PerUnit),
            "tiered" => Some(PricingModel::Tiered),
            "volume" => Some(PricingModel::Volume),
            "committed" => Some(PricingModel::Committed),
            _ => None,
        }
    }
}

impl core::fmt::Display for PricingModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier of a rule's rate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Ordinal, dense 1..N.
    pub tier: u32,
    /// Upper bound of the tier; `None` marks the unbounded top tier.
    pub up_to: Option<Decimal>,
    pub unit_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat_fee: Option<Decimal>,
}

/// Pricing of one metric within one price book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRule {
    pub rule_id: PriceRuleId,
    pub price_book_id: PriceBookId,
    pub metric: MetricType,
    pub pricing_model: PricingModel,
    /// Sorted ascending by `up_to`; at most one unbounded tier, last.
    pub tiers: Vec<Tier>,
    pub unit: Unit,
}

impl PriceRule {
    /// Structural validation of the tier table.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.tiers.is_empty() {
            return Err(DomainError::validation("price rule requires at least one tier"));
        }

        let mut previous_limit: Option<Decimal> = None;
        for (idx, tier) in self.tiers.iter().enumerate() {
            let expected = (idx + 1) as u32;
            if tier.tier != expected {
                return Err(DomainError::validation(format!(
                    "tier ordinals must be dense, expected {expected} found {}",
                    tier.tier
                )));
            }

            match tier.up_to {
                Some(limit) => {
                    if limit <= Decimal::ZERO {
                        return Err(DomainError::validation("tier limit must be positive"));
                    }
                    if let Some(prev) = previous_limit {
                        if limit <= prev {
                            return Err(DomainError::validation(
                                "tier limits must be strictly ascending",
                            ));
                        }
                    }
                    previous_limit = Some(limit);
                }
                None => {
                    if idx + 1 != self.tiers.len() {
                        return Err(DomainError::validation(
                            "only the last tier may be unbounded",
                        ));
                    }
                }
            }

            if tier.unit_price < Decimal::ZERO {
                return Err(DomainError::validation("unit price must be non-negative"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn book(
        id: PriceBookId,
        version: u32,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        parent: Option<PriceBookId>,
    ) -> PriceBook {
        PriceBook {
            price_book_id: id,
            name: "standard".to_string(),
            version,
            effective_from: from,
            effective_until: until,
            currency: "USD".to_string(),
            parent_id: parent,
        }
    }

    #[test]
    fn resolution_prefers_the_latest_effective_from() {
        let old = book(PriceBookId::new(), 1, at(2024, 1, 1), None, None);
        let new = book(
            PriceBookId::new(),
            2,
            at(2024, 3, 1),
            None,
            Some(old.price_book_id),
        );
        let books = [old.clone(), new.clone()];

        let resolved = PriceBook::resolve_effective(&books, at(2024, 4, 1)).unwrap();
        assert_eq!(resolved.price_book_id, new.price_book_id);

        let resolved = PriceBook::resolve_effective(&books, at(2024, 2, 1)).unwrap();
        assert_eq!(resolved.price_book_id, old.price_book_id);

        assert!(PriceBook::resolve_effective(&books, at(2023, 12, 1)).is_none());
    }

    #[test]
    fn effective_until_is_exclusive() {
        let b = book(
            PriceBookId::new(),
            1,
            at(2024, 1, 1),
            Some(at(2024, 2, 1)),
            None,
        );
        assert!(b.is_effective_at(at(2024, 1, 1)));
        assert!(!b.is_effective_at(at(2024, 2, 1)));
    }

    #[test]
    fn overlapping_chain_versions_are_rejected() {
        let root_id = PriceBookId::new();
        let root = book(root_id, 1, at(2024, 1, 1), Some(at(2024, 3, 1)), None);
        let successor = book(
            PriceBookId::new(),
            2,
            at(2024, 2, 1), // overlaps the root's effectivity
            None,
            Some(root_id),
        );

        let err = validate_chains(&[root, successor]).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn disjoint_chain_versions_pass() {
        let root_id = PriceBookId::new();
        let root = book(root_id, 1, at(2024, 1, 1), Some(at(2024, 3, 1)), None);
        let successor = book(PriceBookId::new(), 2, at(2024, 3, 1), None, Some(root_id));

        validate_chains(&[root, successor]).unwrap();
    }

    #[test]
    fn unrelated_books_may_overlap() {
        let a = book(PriceBookId::new(), 1, at(2024, 1, 1), None, None);
        let b = book(PriceBookId::new(), 1, at(2024, 1, 1), None, None);
        validate_chains(&[a, b]).unwrap();
    }

    fn rule_with_tiers(tiers: Vec<Tier>) -> PriceRule {
        PriceRule {
            rule_id: PriceRuleId::new(),
            price_book_id: PriceBookId::new(),
            metric: MetricType::ApiCalls,
            pricing_model: PricingModel::Tiered,
            tiers,
            unit: Unit::Count,
        }
    }

    #[test]
    fn tier_table_validation() {
        // Dense ordinals, ascending limits, unbounded tail: ok.
        rule_with_tiers(vec![
            Tier {
                tier: 1,
                up_to: Some(Decimal::from(1000)),
                unit_price: Decimal::new(10, 2),
                flat_fee: None,
            },
            Tier {
                tier: 2,
                up_to: None,
                unit_price: Decimal::new(5, 2),
                flat_fee: None,
            },
        ])
        .validate()
        .unwrap();

        // Empty table.
        assert!(rule_with_tiers(vec![]).validate().is_err());

        // Non-dense ordinals.
        assert!(
            rule_with_tiers(vec![Tier {
                tier: 2,
                up_to: None,
                unit_price: Decimal::ONE,
                flat_fee: None,
            }])
            .validate()
            .is_err()
        );

        // Unbounded tier not last.
        assert!(
            rule_with_tiers(vec![
                Tier {
                    tier: 1,
                    up_to: None,
                    unit_price: Decimal::ONE,
                    flat_fee: None,
                },
                Tier {
                    tier: 2,
                    up_to: Some(Decimal::from(10)),
                    unit_price: Decimal::ONE,
                    flat_fee: None,
                },
            ])
            .validate()
            .is_err()
        );

        // Non-ascending limits.
        assert!(
            rule_with_tiers(vec![
                Tier {
                    tier: 1,
                    up_to: Some(Decimal::from(1000)),
                    unit_price: Decimal::ONE,
                    flat_fee: None,
                },
                Tier {
                    tier: 2,
                    up_to: Some(Decimal::from(500)),
                    unit_price: Decimal::ONE,
                    flat_fee: None,
                },
            ])
            .validate()
            .is_err()
        );
    }
}
