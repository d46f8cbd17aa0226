//! In-memory implementation of the record backend.
//!
//! # Purpose
//! Implements [`RecordBackend`] with per-table `HashMap`s guarded by a single
//! `tokio::sync::RwLock`. It exists for:
//! - local development and tests (no external dependencies)
//! - deployments where durability is not required
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - Every write takes the write lock, so writes are totally ordered within the
//!   process. That also covers the per-parent serialization the subnet
//!   allocator needs.
//! - Finalized rows are kept so the change feed can report them as deletions.
use super::sequence::VersionSequence;
use super::{
    AllocationCheck, NewRow, ParentLock, RecordBackend, RecordKey, RowUpdate, StoreError,
    StoreResult, StoredRow, Table, json_contains,
};
use async_trait::async_trait;
use chrono::Utc;
use nimbus_common::ids::ResourceId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct TableState {
    rows: HashMap<ResourceId, StoredRow>,
    sequence: VersionSequence,
}

impl TableState {
    fn active_by_name(&self, tenant_id: &str, name: &str) -> Option<&StoredRow> {
        self.rows
            .values()
            .find(|row| row.is_active() && row.tenant_id == tenant_id && row.name == name)
    }

    fn active_by_key(&self, tenant_id: &str, key: &RecordKey) -> Option<&StoredRow> {
        match key {
            RecordKey::Id(id) => self
                .rows
                .get(id)
                .filter(|row| row.is_active() && row.tenant_id == tenant_id),
            RecordKey::Name(name) => self.active_by_name(tenant_id, name),
        }
    }

    // Name and id checks for a batch, including collisions inside the batch.
    fn check_insertable(&self, table: Table, rows: &[NewRow]) -> StoreResult<()> {
        for (index, row) in rows.iter().enumerate() {
            let clashes_in_batch = rows[..index]
                .iter()
                .any(|prior| prior.tenant_id == row.tenant_id && prior.name == row.name);
            if clashes_in_batch || self.active_by_name(&row.tenant_id, &row.name).is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "{} with name {} already exists",
                    table.as_str(),
                    row.name
                )));
            }
            let id_taken = self.rows.contains_key(&row.resource_id)
                || rows[..index]
                    .iter()
                    .any(|prior| prior.resource_id == row.resource_id);
            if id_taken {
                return Err(StoreError::AlreadyExists(format!(
                    "{} with id {} already exists",
                    table.as_str(),
                    row.resource_id
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, row: NewRow) -> StoredRow {
        let stored = StoredRow {
            tenant_id: row.tenant_id,
            resource_id: row.resource_id,
            name: row.name,
            resource_version: self.sequence.next_value(),
            deleted_timestamp: None,
            value: row.value,
        };
        self.rows.insert(stored.resource_id, stored.clone());
        stored
    }
}

/// In-memory record store, cheap to clone and share across handlers.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<HashMap<Table, TableState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let tables = Table::ALL
            .into_iter()
            .map(|table| (table, TableState::default()))
            .collect();
        Self {
            tables: Arc::new(RwLock::new(tables)),
        }
    }
}

#[async_trait]
impl RecordBackend for InMemoryStore {
    async fn insert(&self, table: Table, rows: Vec<NewRow>) -> StoreResult<Vec<StoredRow>> {
        let mut tables = self.tables.write().await;
        let state = tables.entry(table).or_default();
        state.check_insertable(table, &rows)?;
        Ok(rows.into_iter().map(|row| state.insert(row)).collect())
    }

    async fn insert_locked(
        &self,
        parent: &ParentLock,
        table: Table,
        row: NewRow,
        sibling_filter: &Value,
        check: AllocationCheck<'_>,
    ) -> StoreResult<StoredRow> {
        let mut tables = self.tables.write().await;
        let parent_row = tables
            .get(&parent.table)
            .and_then(|state| {
                state.active_by_key(&parent.tenant_id, &RecordKey::Id(parent.resource_id))
            })
            .cloned()
            .ok_or_else(|| StoreError::NotFound(parent.table.as_str().to_string()))?;

        let state = tables.entry(table).or_default();
        let siblings: Vec<StoredRow> = state
            .rows
            .values()
            .filter(|candidate| {
                candidate.is_active()
                    && candidate.tenant_id == parent.tenant_id
                    && json_contains(&candidate.value, sibling_filter)
            })
            .cloned()
            .collect();
        check(&parent_row, &siblings)?;
        state.check_insertable(table, std::slice::from_ref(&row))?;
        Ok(state.insert(row))
    }

    async fn get_active(
        &self,
        table: Table,
        tenant_id: &str,
        key: &RecordKey,
    ) -> StoreResult<Option<StoredRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .and_then(|state| state.active_by_key(tenant_id, key))
            .cloned())
    }

    async fn search_active(
        &self,
        table: Table,
        tenant_id: Option<&str>,
        filter: &Value,
        max_version: Option<i64>,
    ) -> StoreResult<Vec<StoredRow>> {
        let tables = self.tables.read().await;
        let Some(state) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<StoredRow> = state
            .rows
            .values()
            .filter(|row| row.is_active())
            .filter(|row| tenant_id.is_none_or(|tenant| row.tenant_id == tenant))
            .filter(|row| max_version.is_none_or(|max| row.resource_version <= max))
            .filter(|row| json_contains(&row.value, filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.tenant_id, &a.name).cmp(&(&b.tenant_id, &b.name)));
        Ok(rows)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        tenant_id: &str,
        resource_id: ResourceId,
        expected_version: i64,
        update: RowUpdate,
    ) -> StoreResult<Option<StoredRow>> {
        let mut tables = self.tables.write().await;
        let state = tables.entry(table).or_default();
        let matches = state.rows.get(&resource_id).is_some_and(|row| {
            row.is_active()
                && row.tenant_id == tenant_id
                && row.resource_version == expected_version
        });
        if !matches {
            return Ok(None);
        }
        let version = state.sequence.next_value();
        let Some(row) = state.rows.get_mut(&resource_id) else {
            return Ok(None);
        };
        row.value = update.value;
        row.resource_version = version;
        if update.finalize {
            row.deleted_timestamp = Some(Utc::now());
        }
        Ok(Some(row.clone()))
    }

    async fn max_version(&self, table: Table) -> StoreResult<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|state| state.sequence.last_value())
            .unwrap_or(0))
    }

    async fn changes(
        &self,
        table: Table,
        after: i64,
        upto: i64,
        limit: u64,
    ) -> StoreResult<Vec<StoredRow>> {
        let tables = self.tables.read().await;
        let Some(state) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<StoredRow> = state
            .rows
            .values()
            .filter(|row| row.resource_version > after && row.resource_version <= upto)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.resource_version);
        if limit > 0 {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn health_check(&self) -> StoreResult<()> {
        // Always healthy while the process is running.
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
