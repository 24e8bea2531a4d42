//! Price catalog storage.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use meterflow_core::{PriceBookId, PriceRuleId};
use meterflow_pricing::{PriceBook, PriceRule, RatingError, catalog::validate_chains, rater};
use meterflow_telemetry::MetricType;

use super::StoreError;

/// Versioned price books and their rules.
pub trait PriceCatalogStore: Send + Sync {
    /// Insert a book; rejects effectivity overlaps within its version chain.
    fn add_book(&self, book: PriceBook) -> Result<(), StoreError>;

    /// Insert a rule; unique per `(book, metric)`, tier table validated.
    fn add_rule(&self, rule: PriceRule) -> Result<(), StoreError>;

    /// Resolve the effective book and the rule pricing `metric` at `at`.
    ///
    /// The `Err(Ok(..))` shape is avoided by nesting: storage faults are
    /// `StoreError`, missing book/rule are the inner `RatingError`.
    fn resolve(
        &self,
        metric: &MetricType,
        at: DateTime<Utc>,
    ) -> Result<Result<(PriceBook, PriceRule), RatingError>, StoreError>;

    /// Rule lookup for the invoice subsystem.
    fn rule(&self, rule_id: PriceRuleId) -> Result<Option<PriceRule>, StoreError>;

    fn book(&self, book_id: PriceBookId) -> Result<Option<PriceBook>, StoreError>;
}

impl<S> PriceCatalogStore for Arc<S>
where
    S: PriceCatalogStore + ?Sized,
{
    fn add_book(&self, book: PriceBook) -> Result<(), StoreError> {
        (**self).add_book(book)
    }

    fn add_rule(&self, rule: PriceRule) -> Result<(), StoreError> {
        (**self).add_rule(rule)
    }

    fn resolve(
        &self,
        metric: &MetricType,
        at: DateTime<Utc>,
    ) -> Result<Result<(PriceBook, PriceRule), RatingError>, StoreError> {
        (**self).resolve(metric, at)
    }

    fn rule(&self, rule_id: PriceRuleId) -> Result<Option<PriceRule>, StoreError> {
        (**self).rule(rule_id)
    }

    fn book(&self, book_id: PriceBookId) -> Result<Option<PriceBook>, StoreError> {
        (**self).book(book_id)
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    books: Vec<PriceBook>,
    rules: Vec<PriceRule>,
}

/// In-memory price catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPriceCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }
}

impl PriceCatalogStore for InMemoryPriceCatalog {
    fn add_book(&self, book: PriceBook) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        if state
            .books
            .iter()
            .any(|b| b.price_book_id == book.price_book_id)
        {
            return Err(StoreError::Duplicate(book.price_book_id.to_string()));
        }

        let mut candidate = state.books.clone();
        candidate.push(book.clone());
        validate_chains(&candidate).map_err(|e| StoreError::Storage(e.to_string()))?;

        state.books.push(book);
        Ok(())
    }

    fn add_rule(&self, rule: PriceRule) -> Result<(), StoreError> {
        rule.validate()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        if !state
            .books
            .iter()
            .any(|b| b.price_book_id == rule.price_book_id)
        {
            return Err(StoreError::NotFound);
        }
        if state
            .rules
            .iter()
            .any(|r| r.price_book_id == rule.price_book_id && r.metric == rule.metric)
        {
            return Err(StoreError::Duplicate(format!(
                "rule for {} in book {}",
                rule.metric, rule.price_book_id
            )));
        }

        state.rules.push(rule);
        Ok(())
    }

    fn resolve(
        &self,
        metric: &MetricType,
        at: DateTime<Utc>,
    ) -> Result<Result<(PriceBook, PriceRule), RatingError>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let resolved = rater::resolve(&state.books, &state.rules, metric, at)
            .map(|(book, rule)| (book.clone(), rule.clone()));
        Ok(resolved)
    }

    fn rule(&self, rule_id: PriceRuleId) -> Result<Option<PriceRule>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.rules.iter().find(|r| r.rule_id == rule_id).cloned())
    }

    fn book(&self, book_id: PriceBookId) -> Result<Option<PriceBook>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state
            .books
            .iter()
            .find(|b| b.price_book_id == book_id)
            .cloned())
    }
}
