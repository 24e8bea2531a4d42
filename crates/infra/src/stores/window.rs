//! Durable window rows with optimistic concurrency.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use meterflow_core::{AggregationId, ReratingJobId, Versioned};
use meterflow_metering::{AggregatedUsage, Watermark, WindowKey};

use super::StoreError;

/// Mapping `(customer, metric, window) → partial aggregate`.
///
/// One row per key among rows without a re-rating job; a superseding
/// correction row may coexist with the original under its job id, so the
/// full row identity is `(key, rerating_job_id)` (uniqueness enforced at
/// the store). Writers serialize through the version column: `update`
/// succeeds only when the persisted version is exactly one behind the
/// incoming row; the loser reloads and retries.
pub trait WindowStore: Send + Sync {
    /// Return the unique row for `(key, seed's re-rating job)` — finalized
    /// or not — or insert `seed` if none exists, atomically with respect
    /// to concurrent callers. Callers must check `is_final` before
    /// folding.
    ///
    /// The boolean is `true` when the seed was inserted.
    fn get_or_create(
        &self,
        key: &WindowKey,
        seed: AggregatedUsage,
    ) -> Result<(AggregatedUsage, bool), StoreError>;

    /// Conditional write: [`StoreError::Conflict`] unless the stored
    /// version is `row.version() - 1` and the row is not finalized.
    fn update(&self, row: &AggregatedUsage) -> Result<(), StoreError>;

    /// All open rows whose window the watermark has closed.
    fn list_expired(&self, watermark: Watermark) -> Result<Vec<AggregatedUsage>, StoreError>;

    fn get(&self, aggregation_id: AggregationId) -> Result<Option<AggregatedUsage>, StoreError>;

    /// Freeze a row: one-way `is_final` transition, version bump, fresh
    /// `computed_at`. Safe to re-run on an already-final row.
    fn finalize(&self, row: &mut AggregatedUsage, now: DateTime<Utc>) -> Result<(), StoreError> {
        if row.finalize(now) {
            self.update(row)?;
        }
        Ok(())
    }
}

impl<S> WindowStore for Arc<S>
where
    S: WindowStore + ?Sized,
{
    fn get_or_create(
        &self,
        key: &WindowKey,
        seed: AggregatedUsage,
    ) -> Result<(AggregatedUsage, bool), StoreError> {
        (**self).get_or_create(key, seed)
    }

    fn update(&self, row: &AggregatedUsage) -> Result<(), StoreError> {
        (**self).update(row)
    }

    fn list_expired(&self, watermark: Watermark) -> Result<Vec<AggregatedUsage>, StoreError> {
        (**self).list_expired(watermark)
    }

    fn get(&self, aggregation_id: AggregationId) -> Result<Option<AggregatedUsage>, StoreError> {
        (**self).get(aggregation_id)
    }
}

/// Full row identity: the window key plus the re-rating job (if any); the
/// analog of the two partial unique indexes in Postgres.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    window: WindowKey,
    job: Option<ReratingJobId>,
}

#[derive(Debug, Default)]
struct State {
    by_id: HashMap<AggregationId, AggregatedUsage>,
    /// Finalized rows keep occupying their key.
    by_key: HashMap<RowKey, AggregationId>,
}

/// In-memory window store for tests/dev.
///
/// One lock guards both maps, which gives the same atomicity the partial
/// unique index provides in Postgres.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    state: RwLock<State>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }
}

impl WindowStore for InMemoryWindowStore {
    fn get_or_create(
        &self,
        key: &WindowKey,
        seed: AggregatedUsage,
    ) -> Result<(AggregatedUsage, bool), StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        let row_key = RowKey {
            window: key.clone(),
            job: seed.rerating_job_id().cloned(),
        };

        if let Some(id) = state.by_key.get(&row_key) {
            let row = state
                .by_id
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Storage("dangling key index entry".to_string()))?;
            return Ok((row, false));
        }

        if seed.key() != *key {
            return Err(StoreError::Storage(
                "seed row does not match requested key".to_string(),
            ));
        }

        let id = seed.aggregation_id();
        state.by_key.insert(row_key, id);
        state.by_id.insert(id, seed.clone());
        Ok((seed, true))
    }

    fn update(&self, row: &AggregatedUsage) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        let stored = state
            .by_id
            .get(&row.aggregation_id())
            .ok_or(StoreError::NotFound)?;

        if stored.is_final() {
            return Err(StoreError::Conflict(
                "row is finalized and immutable".to_string(),
            ));
        }
        if stored.version() + 1 != row.version() {
            return Err(StoreError::Conflict(format!(
                "stored version {} does not admit incoming version {}",
                stored.version(),
                row.version()
            )));
        }

        state.by_id.insert(row.aggregation_id(), row.clone());
        Ok(())
    }

    fn list_expired(&self, watermark: Watermark) -> Result<Vec<AggregatedUsage>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let mut rows: Vec<_> = state
            .by_id
            .values()
            .filter(|row| !row.is_final() && watermark.closes(&row.window()))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.window().start(), r.customer_id()));
        Ok(rows)
    }

    fn get(&self, aggregation_id: AggregationId) -> Result<Option<AggregatedUsage>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.by_id.get(&aggregation_id).cloned())
    }
}
