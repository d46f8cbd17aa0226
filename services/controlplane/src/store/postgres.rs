//! Postgres-backed implementation of the record backend.
//!
//! # What this module is
//! Implements [`RecordBackend`] using Postgres (via `sqlx`) as the durable,
//! shared store for tenant resources. Each resource kind has its own table with
//! the same columns:
//!
//! `resource_id uuid, tenant_id text, name text, resource_version bigint,
//! deleted_timestamp timestamptz, value jsonb`
//!
//! # Key invariants
//! - `resource_version` defaults to `nextval('<table>_resource_version_seq')`
//!   and every successful update draws a fresh value from the same sequence.
//! - `deleted_timestamp = 'infinity'` marks an active row. A partial unique
//!   index on `(tenant_id, name)` over active rows enforces name uniqueness.
//! - Reads convert the sentinel back to `NULL` so callers only see `Option`.
//!
//! # Concurrency model
//! - Updates are optimistic: `UPDATE ... WHERE resource_version = $expected`.
//! - Allocations lock the parent row with `SELECT ... FOR UPDATE`, so two
//!   allocations under the same parent serialize while other parents proceed.
//! - Sequence values are drawn at write time, not at commit time, so a reader
//!   can observe version N+1 committed before N. The change feed accepts that.
//!
//! # Security notes
//! - Database URLs may contain credentials; avoid logging them.
//! - Dynamic SQL formats only table names from the [`Table`] allowlist.
use super::{
    AllocationCheck, NewRow, ParentLock, RecordBackend, RecordKey, RowUpdate, StoreConfig,
    StoreError, StoreResult, StoredRow, Table,
};
use crate::config::PostgresConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::ids::ResourceId;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const ROW_COLUMNS: &str = "resource_id, tenant_id, name, resource_version, \
     NULLIF(deleted_timestamp, 'infinity'::timestamptz) AS deleted_timestamp, value";

/// Durable record store backed by Postgres.
///
/// # Example
/// ```rust,no_run
/// use controlplane::config::PostgresConfig;
/// use controlplane::store::{StoreConfig, postgres::PostgresStore};
///
/// async fn open(pg: PostgresConfig, cfg: StoreConfig) {
///     let _ = PostgresStore::connect(&pg, cfg).await;
/// }
/// ```
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

/// Row shape shared by every resource table.
#[derive(Debug, Clone, FromRow)]
struct DbRecord {
    resource_id: Uuid,
    tenant_id: String,
    name: String,
    resource_version: i64,
    deleted_timestamp: Option<DateTime<Utc>>,
    value: Value,
}

impl From<DbRecord> for StoredRow {
    fn from(row: DbRecord) -> Self {
        StoredRow {
            tenant_id: row.tenant_id,
            resource_id: ResourceId::from_uuid(row.resource_id),
            name: row.name,
            resource_version: row.resource_version,
            deleted_timestamp: row.deleted_timestamp,
            value: row.value,
        }
    }
}

impl PostgresStore {
    /// Connect to Postgres and apply the embedded migrations.
    ///
    /// # Errors
    /// - Connection, migration, or pool setup failures.
    pub async fn connect(pg: &PostgresConfig, config: StoreConfig) -> StoreResult<Self> {
        Self::connect_internal(pg, config, true).await
    }

    /// Connect without running migrations. Intended for tests that manage the
    /// schema themselves.
    #[cfg(any(test, feature = "pg-tests"))]
    pub async fn connect_without_migrations(
        pg: &PostgresConfig,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        Self::connect_internal(pg, config, false).await
    }

    async fn connect_internal(
        pg: &PostgresConfig,
        config: StoreConfig,
        run_migrations: bool,
    ) -> StoreResult<Self> {
        // Bounded pool and timeouts: fail fast and surface health failures
        // instead of hanging on an unreachable database.
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let connect = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options);
        let pool = tokio::time::timeout(Duration::from_millis(pg.connect_timeout_ms), connect)
            .await
            .map_err(|_| {
                StoreError::Unexpected(anyhow!(
                    "postgres connect timed out after {}ms",
                    pg.connect_timeout_ms
                ))
            })??;

        if run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }
        tracing::info!(
            max_connections = pg.max_connections,
            changes_limit = config.changes_limit,
            "postgres record store ready"
        );
        Ok(Self { pool, config })
    }

    /// Default page size for change queries when the caller passes zero.
    fn limit(&self, requested: u64) -> i64 {
        let limit = if requested == 0 {
            self.config.changes_limit
        } else {
            requested
        };
        limit.min(i64::MAX as u64) as i64
    }
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: Table,
    row: &NewRow,
) -> StoreResult<StoredRow> {
    // Pre-check gives a clean error; the partial unique index still guards
    // against a concurrent insert racing past it.
    let taken = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) FROM {} WHERE tenant_id = $1 AND name = $2 \
         AND deleted_timestamp = 'infinity'",
        table.as_str()
    ))
    .bind(&row.tenant_id)
    .bind(&row.name)
    .fetch_one(&mut **tx)
    .await?
        > 0;
    if taken {
        return Err(already_exists(table, &row.name));
    }

    let inserted = sqlx::query_as::<_, DbRecord>(&format!(
        "INSERT INTO {} (resource_id, tenant_id, name, value) VALUES ($1, $2, $3, $4) \
         RETURNING {ROW_COLUMNS}",
        table.as_str()
    ))
    .bind(row.resource_id.as_uuid())
    .bind(&row.tenant_id)
    .bind(&row.name)
    .bind(&row.value)
    .fetch_one(&mut **tx)
    .await;
    match inserted {
        Ok(record) => Ok(record.into()),
        Err(err) if is_unique_violation(&err) => Err(already_exists(table, &row.name)),
        Err(err) => Err(err.into()),
    }
}

fn already_exists(table: Table, name: &str) -> StoreError {
    StoreError::AlreadyExists(format!("{} with name {name} already exists", table.as_str()))
}

#[async_trait]
impl RecordBackend for PostgresStore {
    async fn insert(&self, table: Table, rows: Vec<NewRow>) -> StoreResult<Vec<StoredRow>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in &rows {
            inserted.push(insert_row(&mut tx, table, row).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_locked(
        &self,
        parent: &ParentLock,
        table: Table,
        row: NewRow,
        sibling_filter: &Value,
        check: AllocationCheck<'_>,
    ) -> StoreResult<StoredRow> {
        let mut tx = self.pool.begin().await?;

        // Exclusive lock on the parent for the rest of the transaction.
        let parent_row = sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE tenant_id = $1 AND resource_id = $2 \
             AND deleted_timestamp = 'infinity' FOR UPDATE",
            parent.table.as_str()
        ))
        .bind(&parent.tenant_id)
        .bind(parent.resource_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .map(StoredRow::from)
        .ok_or_else(|| StoreError::NotFound(parent.table.as_str().to_string()))?;

        let siblings: Vec<StoredRow> = sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE tenant_id = $1 \
             AND deleted_timestamp = 'infinity' AND value @> $2 ORDER BY name",
            table.as_str()
        ))
        .bind(&parent.tenant_id)
        .bind(sibling_filter)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(StoredRow::from)
        .collect();

        // Dropping `tx` on the error path rolls back and releases the lock.
        check(&parent_row, &siblings)?;
        let inserted = insert_row(&mut tx, table, &row).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_active(
        &self,
        table: Table,
        tenant_id: &str,
        key: &RecordKey,
    ) -> StoreResult<Option<StoredRow>> {
        let row = match key {
            RecordKey::Id(id) => {
                sqlx::query_as::<_, DbRecord>(&format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE tenant_id = $1 AND resource_id = $2 \
                     AND deleted_timestamp = 'infinity'",
                    table.as_str()
                ))
                .bind(tenant_id)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
            }
            RecordKey::Name(name) => {
                sqlx::query_as::<_, DbRecord>(&format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE tenant_id = $1 AND name = $2 \
                     AND deleted_timestamp = 'infinity'",
                    table.as_str()
                ))
                .bind(tenant_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(StoredRow::from))
    }

    async fn search_active(
        &self,
        table: Table,
        tenant_id: Option<&str>,
        filter: &Value,
        max_version: Option<i64>,
    ) -> StoreResult<Vec<StoredRow>> {
        // NULL parameters disable the tenant and version bounds.
        let rows = sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT {ROW_COLUMNS} FROM {} \
             WHERE deleted_timestamp = 'infinity' \
               AND ($1::text IS NULL OR tenant_id = $1) \
               AND ($2::bigint IS NULL OR resource_version <= $2) \
               AND value @> $3 \
             ORDER BY tenant_id, name",
            table.as_str()
        ))
        .bind(tenant_id)
        .bind(max_version)
        .bind(filter)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoredRow::from).collect())
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        tenant_id: &str,
        resource_id: ResourceId,
        expected_version: i64,
        update: RowUpdate,
    ) -> StoreResult<Option<StoredRow>> {
        let row = sqlx::query_as::<_, DbRecord>(&format!(
            "UPDATE {table} SET value = $1, \
                 resource_version = nextval('{sequence}'), \
                 deleted_timestamp = CASE WHEN $2 THEN current_timestamp ELSE deleted_timestamp END \
             WHERE tenant_id = $3 AND resource_id = $4 AND resource_version = $5 \
               AND deleted_timestamp = 'infinity' \
             RETURNING {ROW_COLUMNS}",
            table = table.as_str(),
            sequence = table.sequence_name(),
        ))
        .bind(&update.value)
        .bind(update.finalize)
        .bind(tenant_id)
        .bind(resource_id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StoredRow::from))
    }

    async fn max_version(&self, table: Table) -> StoreResult<i64> {
        let max = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COALESCE(MAX(resource_version), 0) FROM {}",
            table.as_str()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn changes(
        &self,
        table: Table,
        after: i64,
        upto: i64,
        limit: u64,
    ) -> StoreResult<Vec<StoredRow>> {
        let rows = sqlx::query_as::<_, DbRecord>(&format!(
            "SELECT {ROW_COLUMNS} FROM {} \
             WHERE resource_version > $1 AND resource_version <= $2 \
             ORDER BY resource_version LIMIT $3",
            table.as_str()
        ))
        .bind(after)
        .bind(upto)
        .bind(self.limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoredRow::from).collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}
