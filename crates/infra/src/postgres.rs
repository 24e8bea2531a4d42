//! Postgres-backed stores.
//!
//! Persistent implementations of the store traits using sqlx. Tenets carried
//! over from the schema: the dedup key is the telemetry event id's primary
//! key, window-row uniqueness is a partial unique index over
//! `(customer_id, metric_type, window_start, window_end) WHERE
//! rerating_job_id IS NULL`, and optimistic concurrency is a conditional
//! `UPDATE … WHERE version = $expected`.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `Duplicate` / `Conflict` |
//! | RowNotFound | N/A | `NotFound` |
//! | anything else | N/A | `Storage` |
//!
//! The store traits are synchronous; like the rest of the sqlx surface here,
//! the trait impls bridge with `tokio::runtime::Handle::block_on` and
//! therefore must be called from within a tokio runtime.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::instrument;

use meterflow_core::{
    AggregationId, ChargeId, CustomerId, EventId, PriceBookId, PriceRuleId, ReratingJobId,
    TimeWindow, Versioned,
};
use meterflow_metering::{AggregatedUsage, Watermark, WindowKey};
use meterflow_pricing::{CalculationMetadata, PriceBook, PriceRule, RatedCharge, RatingError, rater};
use meterflow_telemetry::{MetricType, TelemetryEvent};

use crate::config::StorageConfig;
use crate::stores::{
    ChargeStore, PriceCatalogStore, StoreError, TelemetryEventStore, WindowStore,
};

/// Reference schema for the persisted state layout.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS telemetry_events (
    event_id        UUID PRIMARY KEY,
    event_type      TEXT NOT NULL,
    customer_id     UUID NOT NULL,
    event_time      TIMESTAMPTZ NOT NULL,
    ingestion_time  TIMESTAMPTZ NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}',
    source          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_telemetry_events_customer_time
    ON telemetry_events (customer_id, event_time);

CREATE TABLE IF NOT EXISTS aggregated_usage (
    aggregation_id  UUID PRIMARY KEY,
    customer_id     UUID NOT NULL,
    metric_type     TEXT NOT NULL,
    window_start    TIMESTAMPTZ NOT NULL,
    window_end      TIMESTAMPTZ NOT NULL,
    value           NUMERIC(20,6) NOT NULL CHECK (value >= 0),
    unit            TEXT NOT NULL,
    event_count     BIGINT NOT NULL,
    event_ids       JSONB NOT NULL DEFAULT '[]',
    is_final        BOOLEAN NOT NULL DEFAULT FALSE,
    version         BIGINT NOT NULL,
    computed_at     TIMESTAMPTZ NOT NULL,
    rerating_job_id TEXT,
    CHECK (window_start < window_end)
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_aggregated_usage_window
    ON aggregated_usage (customer_id, metric_type, window_start, window_end)
    WHERE rerating_job_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_aggregated_usage_rerating
    ON aggregated_usage (customer_id, metric_type, window_start, window_end, rerating_job_id)
    WHERE rerating_job_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS ix_aggregated_usage_customer_window
    ON aggregated_usage (customer_id, window_start);
CREATE INDEX IF NOT EXISTS ix_aggregated_usage_metric_window
    ON aggregated_usage (metric_type, window_start);
CREATE INDEX IF NOT EXISTS ix_aggregated_usage_expiry
    ON aggregated_usage (window_end) WHERE NOT is_final;

CREATE TABLE IF NOT EXISTS price_books (
    price_book_id   UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    version         INT NOT NULL,
    effective_from  TIMESTAMPTZ NOT NULL,
    effective_until TIMESTAMPTZ,
    currency        TEXT NOT NULL,
    parent_id       UUID
);
CREATE INDEX IF NOT EXISTS ix_price_books_effectivity
    ON price_books (effective_from, effective_until);

CREATE TABLE IF NOT EXISTS price_rules (
    rule_id         UUID PRIMARY KEY,
    price_book_id   UUID NOT NULL REFERENCES price_books (price_book_id),
    metric_type     TEXT NOT NULL,
    pricing_model   TEXT NOT NULL,
    tiers           JSONB NOT NULL,
    unit            TEXT NOT NULL,
    UNIQUE (price_book_id, metric_type)
);

CREATE TABLE IF NOT EXISTS rated_charges (
    charge_id            UUID PRIMARY KEY,
    customer_id          UUID NOT NULL,
    metric_type          TEXT NOT NULL,
    aggregation_id       UUID,
    price_book_id        UUID NOT NULL,
    price_version        INT NOT NULL,
    rule_id              UUID NOT NULL,
    quantity             NUMERIC(20,6) NOT NULL,
    unit_price           NUMERIC(20,6) NOT NULL,
    subtotal             NUMERIC(20,2) NOT NULL,
    currency             TEXT NOT NULL,
    calculation_metadata JSONB NOT NULL,
    effective_date       TIMESTAMPTZ NOT NULL,
    calculated_at        TIMESTAMPTZ NOT NULL,
    rerating_job_id      TEXT,
    supersedes_charge_id UUID
);
CREATE INDEX IF NOT EXISTS ix_rated_charges_customer_effective
    ON rated_charges (customer_id, effective_date);
CREATE INDEX IF NOT EXISTS ix_rated_charges_metric_effective
    ON rated_charges (metric_type, effective_date);
"#;

/// Build the shared pool with the configured sizing and timeouts.
pub async fn connect(config: &StorageConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))
}

/// Apply the reference schema (idempotent).
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
    }
    Ok(())
}

fn map_sqlx(operation: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate(format!("{operation}: {}", db.message()));
        }
    }
    if matches!(err, sqlx::Error::RowNotFound) {
        return StoreError::NotFound;
    }
    StoreError::Storage(format!("{operation}: {err}"))
}

fn block_on<F: Future>(future: F) -> Result<F::Output, StoreError> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::Storage(
            "postgres stores require a tokio runtime context".to_string(),
        )
    })?;
    Ok(handle.block_on(future))
}

// ---------------------------------------------------------------------------
// Telemetry events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresTelemetryStore {
    pool: Arc<PgPool>,
}

impl PostgresTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id), err)]
    pub async fn insert_new_async(&self, event: &TelemetryEvent) -> Result<(), StoreError> {
        let ingestion_time = event
            .ingestion_time
            .ok_or_else(|| StoreError::Storage("event missing ingestion_time".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO telemetry_events
                (event_id, event_type, customer_id, event_time, ingestion_time, metadata, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(event.customer_id.as_uuid())
        .bind(event.event_time)
        .bind(ingestion_time)
        .bind(JsonValue::Object(event.metadata.clone()))
        .bind(&event.source)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("insert_event", e))?;

        Ok(())
    }

    pub async fn get_async(&self, event_id: EventId) -> Result<Option<TelemetryEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, event_type, customer_id, event_time, ingestion_time, metadata, source
            FROM telemetry_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx("get_event", e))?;

        row.map(event_from_row).transpose()
    }
}

fn event_from_row(row: PgRow) -> Result<TelemetryEvent, StoreError> {
    let metadata = match row
        .try_get::<JsonValue, _>("metadata")
        .map_err(|e| map_sqlx("decode_event", e.into()))?
    {
        JsonValue::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    Ok(TelemetryEvent {
        event_id: EventId::from_uuid(
            row.try_get("event_id")
                .map_err(|e| map_sqlx("decode_event", e.into()))?,
        ),
        event_type: MetricType::from(
            row.try_get::<String, _>("event_type")
                .map_err(|e| map_sqlx("decode_event", e.into()))?,
        ),
        customer_id: CustomerId::from_uuid(
            row.try_get("customer_id")
                .map_err(|e| map_sqlx("decode_event", e.into()))?,
        ),
        event_time: row
            .try_get("event_time")
            .map_err(|e| map_sqlx("decode_event", e.into()))?,
        ingestion_time: row
            .try_get("ingestion_time")
            .map(Some)
            .map_err(|e| map_sqlx("decode_event", e.into()))?,
        metadata,
        source: row
            .try_get("source")
            .map_err(|e| map_sqlx("decode_event", e.into()))?,
    })
}

impl TelemetryEventStore for PostgresTelemetryStore {
    fn insert_new(&self, event: &TelemetryEvent) -> Result<(), StoreError> {
        block_on(self.insert_new_async(event))?
    }

    fn get(&self, event_id: EventId) -> Result<Option<TelemetryEvent>, StoreError> {
        block_on(self.get_async(event_id))?
    }
}

// ---------------------------------------------------------------------------
// Window rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresWindowStore {
    pool: Arc<PgPool>,
}

impl PostgresWindowStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, seed), fields(customer_id = %key.customer_id, metric = %key.metric), err)]
    pub async fn get_or_create_async(
        &self,
        key: &WindowKey,
        seed: AggregatedUsage,
    ) -> Result<(AggregatedUsage, bool), StoreError> {
        if seed.key() != *key {
            return Err(StoreError::Storage(
                "seed row does not match requested key".to_string(),
            ));
        }

        let job = seed.rerating_job_id().map(|j| j.as_str().to_string());

        // The partial unique indexes arbitrate concurrent seeds; losers
        // fall through to the select.
        let inserted = sqlx::query(
            r#"
            INSERT INTO aggregated_usage
                (aggregation_id, customer_id, metric_type, window_start, window_end,
                 value, unit, event_count, event_ids, is_final, version, computed_at,
                 rerating_job_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(seed.aggregation_id().as_uuid())
        .bind(key.customer_id.as_uuid())
        .bind(key.metric.as_str())
        .bind(key.window.start())
        .bind(key.window.end())
        .bind(seed.value())
        .bind(seed.unit().as_str())
        .bind(seed.event_count() as i64)
        .bind(event_ids_json(&seed))
        .bind(seed.is_final())
        .bind(seed.version() as i64)
        .bind(seed.computed_at())
        .bind(job.clone())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("seed_window", e))?
        .rows_affected();

        if inserted == 1 {
            return Ok((seed, true));
        }

        let row = sqlx::query(
            r#"
            SELECT aggregation_id, customer_id, metric_type, window_start, window_end,
                   value, unit, event_ids, is_final, version, computed_at, rerating_job_id
            FROM aggregated_usage
            WHERE customer_id = $1 AND metric_type = $2
              AND window_start = $3 AND window_end = $4
              AND rerating_job_id IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(key.customer_id.as_uuid())
        .bind(key.metric.as_str())
        .bind(key.window.start())
        .bind(key.window.end())
        .bind(job)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx("load_window", e))?;

        Ok((usage_from_row(row)?, false))
    }

    #[instrument(skip(self, row), fields(aggregation_id = %row.aggregation_id()), err)]
    pub async fn update_async(&self, row: &AggregatedUsage) -> Result<(), StoreError> {
        let expected = row.version() as i64 - 1;
        let affected = sqlx::query(
            r#"
            UPDATE aggregated_usage
            SET value = $1, event_count = $2, event_ids = $3, is_final = $4,
                version = $5, computed_at = $6
            WHERE aggregation_id = $7 AND version = $8 AND is_final = FALSE
            "#,
        )
        .bind(row.value())
        .bind(row.event_count() as i64)
        .bind(event_ids_json(row))
        .bind(row.is_final())
        .bind(row.version() as i64)
        .bind(row.computed_at())
        .bind(row.aggregation_id().as_uuid())
        .bind(expected)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("update_window", e))?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::Conflict(format!(
                "window {} rejected write at version {}",
                row.aggregation_id(),
                row.version()
            )));
        }
        Ok(())
    }

    pub async fn list_expired_async(
        &self,
        watermark: Watermark,
    ) -> Result<Vec<AggregatedUsage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregation_id, customer_id, metric_type, window_start, window_end,
                   value, unit, event_ids, is_final, version, computed_at, rerating_job_id
            FROM aggregated_usage
            WHERE is_final = FALSE AND window_end <= $1
            ORDER BY window_start ASC
            "#,
        )
        .bind(watermark.position())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx("list_expired", e))?;

        rows.into_iter().map(usage_from_row).collect()
    }

    pub async fn get_async(
        &self,
        aggregation_id: AggregationId,
    ) -> Result<Option<AggregatedUsage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregation_id, customer_id, metric_type, window_start, window_end,
                   value, unit, event_ids, is_final, version, computed_at, rerating_job_id
            FROM aggregated_usage
            WHERE aggregation_id = $1
            "#,
        )
        .bind(aggregation_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx("get_window", e))?;

        row.map(usage_from_row).transpose()
    }
}

fn event_ids_json(row: &AggregatedUsage) -> JsonValue {
    JsonValue::Array(
        row.event_ids()
            .map(|id| JsonValue::String(id.to_string()))
            .collect(),
    )
}

fn usage_from_row(row: PgRow) -> Result<AggregatedUsage, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx("decode_window", e);

    let event_ids: BTreeSet<EventId> = row
        .try_get::<JsonValue, _>("event_ids")
        .map_err(|e| decode(e.into()))?
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let window = TimeWindow::new(
        row.try_get("window_start").map_err(|e| decode(e.into()))?,
        row.try_get("window_end").map_err(|e| decode(e.into()))?,
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;

    let key = WindowKey::new(
        CustomerId::from_uuid(row.try_get("customer_id").map_err(|e| decode(e.into()))?),
        MetricType::from(
            row.try_get::<String, _>("metric_type")
                .map_err(|e| decode(e.into()))?,
        ),
        window,
    );

    let unit = key.metric.unit();
    AggregatedUsage::from_parts(
        AggregationId::from_uuid(row.try_get("aggregation_id").map_err(|e| decode(e.into()))?),
        key,
        row.try_get::<Decimal, _>("value").map_err(|e| decode(e.into()))?,
        unit,
        event_ids,
        row.try_get("is_final").map_err(|e| decode(e.into()))?,
        row.try_get::<i64, _>("version").map_err(|e| decode(e.into()))? as u64,
        row.try_get("computed_at").map_err(|e| decode(e.into()))?,
        row.try_get::<Option<String>, _>("rerating_job_id")
            .map_err(|e| decode(e.into()))?
            .map(ReratingJobId::from),
    )
    .map_err(|e| StoreError::Storage(e.to_string()))
}

impl WindowStore for PostgresWindowStore {
    fn get_or_create(
        &self,
        key: &WindowKey,
        seed: AggregatedUsage,
    ) -> Result<(AggregatedUsage, bool), StoreError> {
        block_on(self.get_or_create_async(key, seed))?
    }

    fn update(&self, row: &AggregatedUsage) -> Result<(), StoreError> {
        block_on(self.update_async(row))?
    }

    fn list_expired(&self, watermark: Watermark) -> Result<Vec<AggregatedUsage>, StoreError> {
        block_on(self.list_expired_async(watermark))?
    }

    fn get(&self, aggregation_id: AggregationId) -> Result<Option<AggregatedUsage>, StoreError> {
        block_on(self.get_async(aggregation_id))?
    }
}

// ---------------------------------------------------------------------------
// Price catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresPriceCatalog {
    pool: Arc<PgPool>,
}

impl PostgresPriceCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn add_book_async(&self, book: PriceBook) -> Result<(), StoreError> {
        let existing = self.books_async().await?;
        let mut candidate = existing;
        candidate.push(book.clone());
        meterflow_pricing::catalog::validate_chains(&candidate)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO price_books
                (price_book_id, name, version, effective_from, effective_until, currency, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(book.price_book_id.as_uuid())
        .bind(&book.name)
        .bind(book.version as i32)
        .bind(book.effective_from)
        .bind(book.effective_until)
        .bind(&book.currency)
        .bind(book.parent_id.map(|p| *p.as_uuid()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("insert_book", e))?;

        Ok(())
    }

    pub async fn add_rule_async(&self, rule: PriceRule) -> Result<(), StoreError> {
        rule.validate()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let tiers = serde_json::to_value(&rule.tiers)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO price_rules
                (rule_id, price_book_id, metric_type, pricing_model, tiers, unit)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(rule.rule_id.as_uuid())
        .bind(rule.price_book_id.as_uuid())
        .bind(rule.metric.as_str())
        .bind(rule.pricing_model.as_str())
        .bind(tiers)
        .bind(rule.unit.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("insert_rule", e))?;

        Ok(())
    }

    pub async fn books_async(&self) -> Result<Vec<PriceBook>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT price_book_id, name, version, effective_from, effective_until, currency, parent_id
            FROM price_books
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx("list_books", e))?;

        rows.into_iter().map(book_from_row).collect()
    }

    pub async fn rules_async(&self) -> Result<Vec<PriceRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rule_id, price_book_id, metric_type, pricing_model, tiers, unit
            FROM price_rules
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx("list_rules", e))?;

        rows.into_iter().map(rule_from_row).collect()
    }
}

fn book_from_row(row: PgRow) -> Result<PriceBook, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx("decode_book", e);
    Ok(PriceBook {
        price_book_id: PriceBookId::from_uuid(
            row.try_get("price_book_id").map_err(|e| decode(e.into()))?,
        ),
        name: row.try_get("name").map_err(|e| decode(e.into()))?,
        version: row.try_get::<i32, _>("version").map_err(|e| decode(e.into()))? as u32,
        effective_from: row
            .try_get("effective_from")
            .map_err(|e| decode(e.into()))?,
        effective_until: row
            .try_get("effective_until")
            .map_err(|e| decode(e.into()))?,
        currency: row.try_get("currency").map_err(|e| decode(e.into()))?,
        parent_id: row
            .try_get::<Option<uuid::Uuid>, _>("parent_id")
            .map_err(|e| decode(e.into()))?
            .map(PriceBookId::from_uuid),
    })
}

fn rule_from_row(row: PgRow) -> Result<PriceRule, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx("decode_rule", e);

    let tiers = serde_json::from_value(
        row.try_get::<JsonValue, _>("tiers")
            .map_err(|e| decode(e.into()))?,
    )
    .map_err(|e| StoreError::Storage(format!("decode_rule tiers: {e}")))?;

    let model_raw: String = row.try_get("pricing_model").map_err(|e| decode(e.into()))?;
    let pricing_model = meterflow_pricing::PricingModel::parse(&model_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown pricing model {model_raw}")))?;

    let unit_raw: String = row.try_get("unit").map_err(|e| decode(e.into()))?;
    let unit = serde_json::from_value(JsonValue::String(unit_raw.clone()))
        .map_err(|_| StoreError::Storage(format!("unknown unit {unit_raw}")))?;

    Ok(PriceRule {
        rule_id: PriceRuleId::from_uuid(row.try_get("rule_id").map_err(|e| decode(e.into()))?),
        price_book_id: PriceBookId::from_uuid(
            row.try_get("price_book_id").map_err(|e| decode(e.into()))?,
        ),
        metric: MetricType::from(
            row.try_get::<String, _>("metric_type")
                .map_err(|e| decode(e.into()))?,
        ),
        pricing_model,
        tiers,
        unit,
    })
}

impl PriceCatalogStore for PostgresPriceCatalog {
    fn add_book(&self, book: PriceBook) -> Result<(), StoreError> {
        block_on(self.add_book_async(book))?
    }

    fn add_rule(&self, rule: PriceRule) -> Result<(), StoreError> {
        block_on(self.add_rule_async(rule))?
    }

    fn resolve(
        &self,
        metric: &MetricType,
        at: DateTime<Utc>,
    ) -> Result<Result<(PriceBook, PriceRule), RatingError>, StoreError> {
        block_on(async {
            let books = self.books_async().await?;
            let rules = self.rules_async().await?;
            Ok::<_, StoreError>(
                rater::resolve(&books, &rules, metric, at)
                    .map(|(book, rule)| (book.clone(), rule.clone())),
            )
        })?
    }

    fn rule(&self, rule_id: PriceRuleId) -> Result<Option<PriceRule>, StoreError> {
        block_on(async {
            let rules = self.rules_async().await?;
            Ok::<_, StoreError>(rules.into_iter().find(|r| r.rule_id == rule_id))
        })?
    }

    fn book(&self, book_id: PriceBookId) -> Result<Option<PriceBook>, StoreError> {
        block_on(async {
            let books = self.books_async().await?;
            Ok::<_, StoreError>(books.into_iter().find(|b| b.price_book_id == book_id))
        })?
    }
}

// ---------------------------------------------------------------------------
// Rated charges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresChargeStore {
    pool: Arc<PgPool>,
}

impl PostgresChargeStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, charge), fields(charge_id = %charge.charge_id), err)]
    pub async fn insert_async(&self, charge: &RatedCharge) -> Result<(), StoreError> {
        let metadata = serde_json::to_value(&charge.calculation_metadata)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO rated_charges
                (charge_id, customer_id, metric_type, aggregation_id, price_book_id,
                 price_version, rule_id, quantity, unit_price, subtotal, currency,
                 calculation_metadata, effective_date, calculated_at, rerating_job_id,
                 supersedes_charge_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (charge_id) DO NOTHING
            "#,
        )
        .bind(charge.charge_id.as_uuid())
        .bind(charge.customer_id.as_uuid())
        .bind(charge.metric.as_str())
        .bind(charge.aggregation_id.map(|a| *a.as_uuid()))
        .bind(charge.price_book_id.as_uuid())
        .bind(charge.price_version as i32)
        .bind(charge.rule_id.as_uuid())
        .bind(charge.quantity)
        .bind(charge.unit_price)
        .bind(charge.subtotal)
        .bind(&charge.currency)
        .bind(metadata)
        .bind(charge.calculation_metadata.effective_date)
        .bind(charge.calculated_at)
        .bind(charge.rerating_job_id.as_ref().map(|j| j.as_str().to_string()))
        .bind(charge.supersedes_charge_id.map(|c| *c.as_uuid()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx("insert_charge", e))?;

        Ok(())
    }

    pub async fn get_async(&self, charge_id: ChargeId) -> Result<Option<RatedCharge>, StoreError> {
        let sql = format!("{CHARGE_SELECT} WHERE charge_id = $1");
        let row = sqlx::query(&sql)
            .bind(charge_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx("get_charge", e))?;

        row.map(charge_from_row).transpose()
    }

    pub async fn find_charges_for_period_async(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RatedCharge>, StoreError> {
        let sql = format!(
            "{CHARGE_SELECT}
             WHERE customer_id = $1 AND effective_date >= $2 AND effective_date < $3
             ORDER BY calculated_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(customer_id.as_uuid())
            .bind(start)
            .bind(end)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx("find_charges_for_period", e))?;

        rows.into_iter().map(charge_from_row).collect()
    }

    pub async fn latest_for_window_async(
        &self,
        customer_id: CustomerId,
        metric: &MetricType,
        window: TimeWindow,
    ) -> Result<Option<RatedCharge>, StoreError> {
        let sql = format!(
            "{CHARGE_SELECT}
             WHERE customer_id = $1 AND metric_type = $2
               AND effective_date >= $3 AND effective_date < $4
             ORDER BY calculated_at DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(customer_id.as_uuid())
            .bind(metric.as_str())
            .bind(window.start())
            .bind(window.end())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx("latest_for_window", e))?;

        row.map(charge_from_row).transpose()
    }
}

const CHARGE_SELECT: &str = r#"
    SELECT charge_id, customer_id, metric_type, aggregation_id, price_book_id,
           price_version, rule_id, quantity, unit_price, subtotal, currency,
           calculation_metadata, calculated_at, rerating_job_id, supersedes_charge_id
    FROM rated_charges
"#;

fn charge_from_row(row: PgRow) -> Result<RatedCharge, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx("decode_charge", e);

    let calculation_metadata: CalculationMetadata = serde_json::from_value(
        row.try_get::<JsonValue, _>("calculation_metadata")
            .map_err(|e| decode(e.into()))?,
    )
    .map_err(|e| StoreError::Storage(format!("decode_charge metadata: {e}")))?;

    Ok(RatedCharge {
        charge_id: ChargeId::from_uuid(row.try_get("charge_id").map_err(|e| decode(e.into()))?),
        customer_id: CustomerId::from_uuid(
            row.try_get("customer_id").map_err(|e| decode(e.into()))?,
        ),
        metric: MetricType::from(
            row.try_get::<String, _>("metric_type")
                .map_err(|e| decode(e.into()))?,
        ),
        aggregation_id: row
            .try_get::<Option<uuid::Uuid>, _>("aggregation_id")
            .map_err(|e| decode(e.into()))?
            .map(AggregationId::from_uuid),
        price_book_id: PriceBookId::from_uuid(
            row.try_get("price_book_id").map_err(|e| decode(e.into()))?,
        ),
        price_version: row
            .try_get::<i32, _>("price_version")
            .map_err(|e| decode(e.into()))? as u32,
        rule_id: PriceRuleId::from_uuid(row.try_get("rule_id").map_err(|e| decode(e.into()))?),
        quantity: row.try_get("quantity").map_err(|e| decode(e.into()))?,
        unit_price: row.try_get("unit_price").map_err(|e| decode(e.into()))?,
        subtotal: row.try_get("subtotal").map_err(|e| decode(e.into()))?,
        currency: row.try_get("currency").map_err(|e| decode(e.into()))?,
        calculation_metadata,
        calculated_at: row.try_get("calculated_at").map_err(|e| decode(e.into()))?,
        rerating_job_id: row
            .try_get::<Option<String>, _>("rerating_job_id")
            .map_err(|e| decode(e.into()))?
            .map(ReratingJobId::from),
        supersedes_charge_id: row
            .try_get::<Option<uuid::Uuid>, _>("supersedes_charge_id")
            .map_err(|e| decode(e.into()))?
            .map(ChargeId::from_uuid),
    })
}

impl ChargeStore for PostgresChargeStore {
    fn insert(&self, charge: &RatedCharge) -> Result<(), StoreError> {
        block_on(self.insert_async(charge))?
    }

    fn get(&self, charge_id: ChargeId) -> Result<Option<RatedCharge>, StoreError> {
        block_on(self.get_async(charge_id))?
    }

    fn find_charges_for_period(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RatedCharge>, StoreError> {
        block_on(self.find_charges_for_period_async(customer_id, start, end))?
    }

    fn latest_for_window(
        &self,
        customer_id: CustomerId,
        metric: &MetricType,
        window: TimeWindow,
    ) -> Result<Option<RatedCharge>, StoreError> {
        block_on(self.latest_for_window_async(customer_id, metric, window))?
    }
}
