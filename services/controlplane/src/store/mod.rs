//! Persistence seam for versioned resource records.
//!
//! # Purpose
//! Every resource kind is stored in its own table with an identical row shape.
//! The [`RecordBackend`] trait is written against that shape only; the typed
//! record engine in `crate::engine` sits on top and never sees SQL.
//!
//! # Key invariants
//! - `resource_version` comes from the table's sequence on every insert and
//!   every successful compare-and-swap, and is never reused.
//! - At most one active row (`deleted_timestamp` unset) per `(tenant_id, name)`.
//! - Once a row is finalized its `deleted_timestamp` never changes again.
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::ids::ResourceId;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod sequence;

/// Allowlist of resource tables. Dynamic SQL only ever formats these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Instance,
    LoadBalancer,
    Vnet,
    Vpc,
    Subnet,
    Port,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Instance,
        Table::LoadBalancer,
        Table::Vnet,
        Table::Vpc,
        Table::Subnet,
        Table::Port,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Instance => "instance",
            Table::LoadBalancer => "load_balancer",
            Table::Vnet => "vnet",
            Table::Vpc => "vpc",
            Table::Subnet => "subnet",
            Table::Port => "port",
        }
    }

    pub fn sequence_name(&self) -> &'static str {
        match self {
            Table::Instance => "instance_resource_version_seq",
            Table::LoadBalancer => "load_balancer_resource_version_seq",
            Table::Vnet => "vnet_resource_version_seq",
            Table::Vpc => "vpc_resource_version_seq",
            Table::Subnet => "subnet_resource_version_seq",
            Table::Port => "port_resource_version_seq",
        }
    }
}

/// How a caller addresses a single record within a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Id(ResourceId),
    Name(String),
}

/// One persisted row. `value` holds the serialized `{metadata, spec, status}`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub tenant_id: String,
    pub resource_id: ResourceId,
    pub name: String,
    pub resource_version: i64,
    /// `None` while the row is active.
    pub deleted_timestamp: Option<DateTime<Utc>>,
    pub value: Value,
}

impl StoredRow {
    pub fn is_active(&self) -> bool {
        self.deleted_timestamp.is_none()
    }
}

/// Insert payload. The backend assigns the version.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub tenant_id: String,
    pub resource_id: ResourceId,
    pub name: String,
    pub value: Value,
}

/// Compare-and-swap payload.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub value: Value,
    /// Stamp `deleted_timestamp` with the current time in the same write.
    pub finalize: bool,
}

/// The parent row an allocation is serialized on.
#[derive(Debug, Clone)]
pub struct ParentLock {
    pub table: Table,
    pub tenant_id: String,
    pub resource_id: ResourceId,
}

/// Validation run while the parent row is locked. Receives the parent row and
/// the active sibling rows matching the sibling filter.
pub type AllocationCheck<'a> = &'a (dyn Fn(&StoredRow, &[StoredRow]) -> StoreResult<()> + Send + Sync);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of rows a single change query returns.
    pub changes_limit: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unexpected(anyhow!(err))
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(anyhow!(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unexpected(anyhow!("record encoding: {err}"))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Insert all rows atomically. Fails with `AlreadyExists` if any name is
    /// taken by an active row (including another row of the same batch).
    async fn insert(&self, table: Table, rows: Vec<NewRow>) -> StoreResult<Vec<StoredRow>>;

    /// Lock the active parent row, load active siblings in `table` matching
    /// `sibling_filter`, run `check`, then insert `row`. All in one transaction.
    async fn insert_locked(
        &self,
        parent: &ParentLock,
        table: Table,
        row: NewRow,
        sibling_filter: &Value,
        check: AllocationCheck<'_>,
    ) -> StoreResult<StoredRow>;

    async fn get_active(
        &self,
        table: Table,
        tenant_id: &str,
        key: &RecordKey,
    ) -> StoreResult<Option<StoredRow>>;

    /// Active rows whose value contains `filter`, ordered by tenant then name.
    /// `tenant_id = None` spans all tenants; `max_version` bounds the snapshot.
    async fn search_active(
        &self,
        table: Table,
        tenant_id: Option<&str>,
        filter: &Value,
        max_version: Option<i64>,
    ) -> StoreResult<Vec<StoredRow>>;

    /// Write `update` if the active row still carries `expected_version`.
    /// Returns `None` when no row matched.
    async fn compare_and_swap(
        &self,
        table: Table,
        tenant_id: &str,
        resource_id: ResourceId,
        expected_version: i64,
        update: RowUpdate,
    ) -> StoreResult<Option<StoredRow>>;

    /// Highest version currently present in the table, or 0.
    async fn max_version(&self, table: Table) -> StoreResult<i64>;

    /// Rows (active or finalized) with `after < version <= upto`, ordered by
    /// version, at most `limit` of them.
    async fn changes(
        &self,
        table: Table,
        after: i64,
        upto: i64,
        limit: u64,
    ) -> StoreResult<Vec<StoredRow>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Postgres-style `@>` containment for JSON documents.
///
/// Objects contain another object when every key of the needle is contained
/// in the matching value; arrays when every needle element is contained in
/// some haystack element; scalars compare by equality.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, value)| {
            have.get(key)
                .map(|candidate| json_contains(candidate, value))
                .unwrap_or(false)
        }),
        (Value::Array(have), Value::Array(want)) => want
            .iter()
            .all(|value| have.iter().any(|candidate| json_contains(candidate, value))),
        (have, want) => have == want,
    }
}
