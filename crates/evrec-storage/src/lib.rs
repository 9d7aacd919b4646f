//! Storage capability for the reconciliation engine: one read query and two
//! writes applied inside a single transaction.
//!
//! The Postgres table is expected to look like:
//!
//! | column | type |
//! |---|---|
//! | `id` | `bigint` primary key |
//! | `name`, `venue_name`, `type`, `payment_method` | `text` |
//! | `start_date_utc` | `timestamptz` |
//! | `start_date_est` | `timestamp` |
//! | `venue_id`, `accepted_offers`, `failed_offers` | `bigint` |
//! | `delayed_delivery`, `active`, `on_offers`, `on_snooze`, `on_sapi_pricing`, `using_sapi_pricing` | `boolean` |
//! | `deleted` | `boolean not null default false` |
//! | `marketplaces` | `jsonb` array of `{name, marketplace_name, item_id, ...}` |

use std::fmt;

use async_trait::async_trait;
use evrec_core::{Column, EventRecord, EventSource, FieldValue, Marketplaces};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

pub mod memory;

pub use memory::MemoryEventStore;

pub const CRATE_NAME: &str = "evrec-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("record id {0} does not fit the id column")]
    IdOutOfRange(u64),
    #[error("row has negative id {0}")]
    NegativeId(i64),
    #[error("record {record_id} has undecodable marketplaces: {error}")]
    Marketplaces {
        record_id: u64,
        #[source]
        error: serde_json::Error,
    },
    #[error("record without an id cannot be stored")]
    MissingId,
    #[error("canonical record {0} does not exist")]
    CanonicalMissing(u64),
    #[error("injected failure while retiring record {0}")]
    Injected(u64),
}

/// Writes for one duplicate group. Applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyPlan {
    pub canonical_id: u64,
    pub diff: EventRecord,
    pub retire_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub canonical_updated: bool,
    pub retired: u64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Rows mapped to `target` whose item id is shared by more than one row, ordered by id.
    async fn load_duplicate_candidates(
        &self,
        target: &EventSource,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Updates the canonical row with the diff's columns and soft-deletes the
    /// retired rows in one transaction. An empty diff skips the update, an
    /// empty retire list skips the delete.
    async fn apply(&self, plan: &ApplyPlan) -> Result<ApplyOutcome, StoreError>;
}

/// Validated, optionally schema-qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    parts: Vec<String>,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let parts: Vec<String> = raw.split('.').map(str::to_string).collect();
        let valid = parts.len() <= 2 && parts.iter().all(|part| is_plain_identifier(part));
        if !valid {
            return Err(StoreError::InvalidTableName(raw.to_string()));
        }
        Ok(Self { parts })
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted: Vec<String> = self.parts.iter().map(|p| format!("\"{p}\"")).collect();
        f.write_str(&quoted.join("."))
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub table: String,
    pub max_connections: u32,
}

pub struct PgEventStore {
    pool: PgPool,
    table: TableName,
}

impl PgEventStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let table = TableName::parse(&config.table)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn load_duplicate_candidates(
        &self,
        target: &EventSource,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let sql = duplicate_candidates_sql(&self.table);
        let rows = sqlx::query(&sql)
            .bind(&target.name)
            .bind(&target.marketplace_name)
            .fetch_all(&self.pool)
            .await?;
        debug!(rows = rows.len(), source = %target, "loaded duplicate candidates");
        rows.iter().map(record_from_row).collect()
    }

    async fn apply(&self, plan: &ApplyPlan) -> Result<ApplyOutcome, StoreError> {
        let canonical_id = to_db_id(plan.canonical_id)?;
        let retire_ids = plan
            .retire_ids
            .iter()
            .map(|id| to_db_id(*id))
            .collect::<Result<Vec<_>, _>>()?;

        // Dropping `tx` on any early return rolls the group back.
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();

        if let Some(mut update) = canonical_update(&self.table, canonical_id, plan.diff.assignments())? {
            let result = update.build().execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::CanonicalMissing(plan.canonical_id));
            }
            outcome.canonical_updated = true;
        }

        if !retire_ids.is_empty() {
            let sql = retire_sql(&self.table);
            let result = sqlx::query(&sql).bind(retire_ids).execute(&mut *tx).await?;
            outcome.retired = result.rows_affected();
        }

        tx.commit().await?;
        debug!(
            canonical_id = plan.canonical_id,
            canonical_updated = outcome.canonical_updated,
            retired = outcome.retired,
            "committed reconciliation"
        );
        Ok(outcome)
    }
}

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::IdOutOfRange(id))
}

fn select_list() -> String {
    Column::ALL
        .iter()
        .map(|column| format!("e.\"{}\"", column.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rows whose `(name, marketplace_name)` entry carries an item id shared with another row.
pub fn duplicate_candidates_sql(table: &TableName) -> String {
    format!(
        r#"
        WITH matched AS (
            SELECT e.id, m.entry ->> 'item_id' AS external_key
              FROM {table} e
             CROSS JOIN LATERAL jsonb_array_elements(COALESCE(e.marketplaces, '[]'::jsonb)) AS m(entry)
             WHERE m.entry ->> 'name' = $1
               AND m.entry ->> 'marketplace_name' = $2
        ),
        duplicated AS (
            SELECT external_key
              FROM matched
             GROUP BY external_key
            HAVING count(DISTINCT id) > 1
        )
        SELECT {columns}
          FROM {table} e
         WHERE e.id IN (SELECT matched.id FROM matched JOIN duplicated USING (external_key))
         ORDER BY e.id
        "#,
        columns = select_list(),
    )
}

pub fn retire_sql(table: &TableName) -> String {
    format!(
        "UPDATE {table} SET \"{deleted}\" = true WHERE \"{id}\" = ANY($1)",
        deleted = Column::Deleted.as_str(),
        id = Column::Id.as_str(),
    )
}

/// `UPDATE ... SET <set columns> WHERE id = $n`, or `None` when nothing is set.
pub fn canonical_update(
    table: &TableName,
    id: i64,
    assignments: Vec<(Column, FieldValue)>,
) -> Result<Option<QueryBuilder<'static, Postgres>>, StoreError> {
    if assignments.is_empty() {
        return Ok(None);
    }

    let mut builder = QueryBuilder::<Postgres>::new(format!("UPDATE {table} SET "));
    let mut set = builder.separated(", ");
    for (column, value) in assignments {
        set.push(format!("\"{}\" = ", column.as_str()));
        match value {
            FieldValue::Identifier(v) => set.push_bind_unseparated(to_db_id(v)?),
            FieldValue::Text(v) => set.push_bind_unseparated(v),
            FieldValue::Integer(v) => set.push_bind_unseparated(v),
            FieldValue::Flag(v) => set.push_bind_unseparated(v),
            FieldValue::Timestamp(v) => set.push_bind_unseparated(v),
            FieldValue::LocalTimestamp(v) => set.push_bind_unseparated(v),
            FieldValue::Marketplaces(v) => set.push_bind_unseparated(Json(v)),
        };
    }
    builder.push(format!(" WHERE \"{}\" = ", Column::Id.as_str()));
    builder.push_bind(id);
    Ok(Some(builder))
}

fn record_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let raw_id: i64 = row.try_get(Column::Id.as_str())?;
    let id = u64::try_from(raw_id).map_err(|_| StoreError::NegativeId(raw_id))?;

    let raw_markets: Option<JsonValue> = row.try_get(Column::Marketplaces.as_str())?;
    let marketplaces = match raw_markets {
        Some(value) if !value.is_null() => serde_json::from_value::<Marketplaces>(value)
            .map_err(|error| StoreError::Marketplaces { record_id: id, error })?,
        _ => Marketplaces::new(),
    };

    Ok(EventRecord {
        id: Some(id),
        name: row.try_get(Column::Name.as_str())?,
        start_date_utc: row.try_get(Column::StartDateUtc.as_str())?,
        start_date_local: row.try_get(Column::StartDateEst.as_str())?,
        venue_id: row.try_get(Column::VenueId.as_str())?,
        venue_name: row.try_get(Column::VenueName.as_str())?,
        delayed_delivery: row.try_get(Column::DelayedDelivery.as_str())?,
        accepted_offers: row.try_get(Column::AcceptedOffers.as_str())?,
        failed_offers: row.try_get(Column::FailedOffers.as_str())?,
        event_type: row.try_get(Column::Type.as_str())?,
        active: row.try_get(Column::Active.as_str())?,
        deleted: row.try_get(Column::Deleted.as_str())?,
        on_offers: row.try_get(Column::OnOffers.as_str())?,
        on_snooze: row.try_get(Column::OnSnooze.as_str())?,
        payment_method: row.try_get(Column::PaymentMethod.as_str())?,
        on_sapi_pricing: row.try_get(Column::OnSapiPricing.as_str())?,
        using_sapi_pricing: row.try_get(Column::UsingSapiPricing.as_str())?,
        marketplaces,
    })
}
