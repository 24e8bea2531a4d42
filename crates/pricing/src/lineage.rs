//! Correction lineage.
//!
//! `supersedes_charge_id` links a delta charge to the charge it amends,
//! forming a chain back to the originally billed line. Chains are resolved
//! iteratively with a depth cap; a cycle is a data fault, not a reason to
//! spin.

use std::collections::HashSet;

use thiserror::Error;

use meterflow_core::ChargeId;

use crate::charge::RatedCharge;

/// Upper bound on corrections for a single logical charge.
pub const MAX_CHAIN_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineageError {
    #[error("supersedes chain revisits charge {0}")]
    Cycle(ChargeId),

    #[error("supersedes chain exceeds depth {0}")]
    DepthExceeded(usize),

    #[error("charge {0} referenced by lineage was not found")]
    MissingLink(ChargeId),
}

/// Walk the correction chain from `head` back to the original charge.
///
/// Returns charge ids newest-first, starting with `head` itself. `lookup`
/// resolves a charge by id (typically a store read).
pub fn correction_chain<F>(
    head: &RatedCharge,
    mut lookup: F,
) -> Result<Vec<ChargeId>, LineageError>
where
    F: FnMut(ChargeId) -> Option<RatedCharge>,
{
    let mut chain = vec![head.charge_id];
    let mut visited: HashSet<ChargeId> = HashSet::from([head.charge_id]);
    let mut next = head.supersedes_charge_id;

    while let Some(id) = next {
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(LineageError::DepthExceeded(MAX_CHAIN_DEPTH));
        }
        if !visited.insert(id) {
            return Err(LineageError::Cycle(id));
        }

        let charge = lookup(id).ok_or(LineageError::MissingLink(id))?;
        chain.push(id);
        next = charge.supersedes_charge_id;
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charge::CalculationMetadata;
    use chrono::{TimeZone, Utc};
    use meterflow_core::{CustomerId, PriceBookId, PriceRuleId};
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    fn charge(supersedes: Option<ChargeId>) -> RatedCharge {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        RatedCharge {
            charge_id: ChargeId::new(),
            customer_id: CustomerId::new(),
            metric: meterflow_telemetry::MetricType::ApiCalls,
            aggregation_id: None,
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
                effective_date: when,
            },
            calculated_at: when,
            rerating_job_id: None,
            supersedes_charge_id: supersedes,
        }
    }

    #[test]
    fn walks_back_to_the_original() {
        let original = charge(None);
        let first_fix = charge(Some(original.charge_id));
        let second_fix = charge(Some(first_fix.charge_id));

        let by_id: HashMap<ChargeId, RatedCharge> = [&original, &first_fix, &second_fix]
            .into_iter()
            .map(|c| (c.charge_id, c.clone()))
            .collect();

        let chain = correction_chain(&second_fix, |id| by_id.get(&id).cloned()).unwrap();
        assert_eq!(
            chain,
            vec![second_fix.charge_id, first_fix.charge_id, original.charge_id]
        );
    }

    #[test]
    fn detects_cycles() {
        let mut a = charge(None);
        let mut b = charge(None);
        b.supersedes_charge_id = Some(a.charge_id);
        a.supersedes_charge_id = Some(b.charge_id);

        let by_id: HashMap<ChargeId, RatedCharge> = [&a, &b]
            .into_iter()
            .map(|c| (c.charge_id, c.clone()))
            .collect();

        let err = correction_chain(&a, |id| by_id.get(&id).cloned()).unwrap_err();
        assert_eq!(err, LineageError::Cycle(a.charge_id));
    }

    #[test]
    fn missing_links_are_reported() {
        let dangling = charge(Some(ChargeId::new()));
        let err = correction_chain(&dangling, |_| None).unwrap_err();
        assert!(matches!(err, LineageError::MissingLink(_)));
    }
}
