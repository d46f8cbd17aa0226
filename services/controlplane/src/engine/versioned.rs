//! Typed record engine over the [`RecordBackend`] seam.
//!
//! # Purpose
//! One implementation of create, get, search, compare-and-swap update,
//! deletion intent and finalization, shared by every resource kind.
//!
//! # Key invariants
//! - Mutations only go through compare-and-swap on `resource_version`.
//! - A pinned update (caller passed an expected version) is never retried.
//! - An unpinned update that loses a race re-reads and re-applies its
//!   transform, bounded by the configured backoff policy.
//! - Identity fields and a recorded deletion intent cannot be changed by a
//!   transform.
use crate::model::{
    LifecyclePhase, Metadata, NewResource, Record, RecordKey, ResourceKind, ResourceStatus,
    SearchFilter,
};
use crate::observability;
use crate::retry::{BackoffPolicy, retry_with_backoff};
use crate::store::{NewRow, RecordBackend, RowUpdate, StoreError, StoreResult, StoredRow};
use anyhow::anyhow;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Outcome of one compare-and-swap attempt.
#[derive(Debug)]
enum Attempt {
    /// The row moved on between read and write.
    Conflict,
    Failed(StoreError),
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Conflict => write!(f, "resource version conflict"),
            Attempt::Failed(err) => write!(f, "{err}"),
        }
    }
}

pub struct VersionedStore<K: ResourceKind> {
    backend: Arc<dyn RecordBackend>,
    cas_retry: BackoffPolicy,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> Clone for VersionedStore<K> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            cas_retry: self.cas_retry,
            _kind: PhantomData,
        }
    }
}

impl<K: ResourceKind> VersionedStore<K> {
    pub fn new(backend: Arc<dyn RecordBackend>, cas_retry: BackoffPolicy) -> Self {
        Self {
            backend,
            cas_retry,
            _kind: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RecordBackend> {
        &self.backend
    }

    /// Validate a draft and fill in server-side defaults without writing it.
    ///
    /// The id defaults to a fresh UUID and the name defaults to the id.
    pub fn prepare(&self, tenant_id: &str, draft: NewResource<K>) -> StoreResult<Record<K>> {
        K::validate_spec(&draft.spec).map_err(StoreError::InvalidArgument)?;
        let resource_id = draft.resource_id.unwrap_or_default();
        let name = match draft.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => resource_id.to_string(),
        };
        Ok(Record {
            metadata: Metadata {
                tenant_id: tenant_id.to_string(),
                resource_id,
                name,
                labels: draft.labels,
                creation_timestamp: Utc::now(),
                deletion_timestamp: None,
                deleted_timestamp: None,
                resource_version: 0,
            },
            spec: draft.spec,
            status: ResourceStatus::default(),
        })
    }

    pub async fn create(&self, tenant_id: &str, draft: NewResource<K>) -> StoreResult<Record<K>> {
        let record = self.prepare(tenant_id, draft)?;
        self.insert_prepared(vec![record])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Unexpected(anyhow!("insert returned no rows")))
    }

    /// Create several records of one tenant. Either all are written or none.
    pub async fn create_batch(
        &self,
        tenant_id: &str,
        drafts: Vec<NewResource<K>>,
    ) -> StoreResult<Vec<Record<K>>> {
        let records = drafts
            .into_iter()
            .map(|draft| self.prepare(tenant_id, draft))
            .collect::<StoreResult<Vec<_>>>()?;
        self.insert_prepared(records).await
    }

    /// Insert records produced by [`Self::prepare`], possibly after the caller
    /// adjusted them (placement, for instance).
    pub async fn insert_prepared(&self, records: Vec<Record<K>>) -> StoreResult<Vec<Record<K>>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let rows = records
            .iter()
            .map(Self::to_new_row)
            .collect::<StoreResult<Vec<_>>>()?;
        let count = rows.len() as u64;
        let stored = self.backend.insert(K::TABLE, rows).await?;
        metrics::counter!(observability::RECORD_WRITES, "table" => K::TABLE.as_str(), "op" => "create")
            .increment(count);
        stored.into_iter().map(Self::decode).collect()
    }

    pub async fn get(&self, tenant_id: &str, key: &RecordKey) -> StoreResult<Record<K>> {
        let row = self
            .backend
            .get_active(K::TABLE, tenant_id, key)
            .await?
            .ok_or_else(|| not_found::<K>(key))?;
        Self::decode(row)
    }

    /// Active records of the tenant matching `filter`, ordered by name.
    pub async fn search(&self, tenant_id: &str, filter: &SearchFilter) -> StoreResult<Vec<Record<K>>> {
        self.backend
            .search_active(K::TABLE, Some(tenant_id), &filter.to_document(), None)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// Read-modify-write through compare-and-swap.
    ///
    /// `transform` may run more than once when the update is unpinned and
    /// loses a race. Errors it returns abort the update unchanged.
    pub async fn update<F>(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
        transform: F,
    ) -> StoreResult<Record<K>>
    where
        F: Fn(Record<K>) -> StoreResult<Record<K>> + Send + Sync,
    {
        self.write(tenant_id, key, expected_version, false, "update", transform)
            .await
    }

    /// Replace labels and/or spec. Spec changes go through the kind's update
    /// rules and validation.
    pub async fn update_fields(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
        labels: Option<BTreeMap<String, String>>,
        spec: Option<K::Spec>,
    ) -> StoreResult<Record<K>> {
        self.update(tenant_id, key, expected_version, move |mut record| {
            if let Some(requested) = spec.clone() {
                let merged = K::apply_spec_update(&record.spec, requested)
                    .map_err(StoreError::InvalidArgument)?;
                K::validate_spec(&merged).map_err(StoreError::InvalidArgument)?;
                record.spec = merged;
            }
            if let Some(labels) = &labels {
                record.metadata.labels = labels.clone();
            }
            Ok(record)
        })
        .await
    }

    pub async fn update_status(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
        status: ResourceStatus<K::Phase>,
    ) -> StoreResult<Record<K>> {
        self.write(tenant_id, key, expected_version, false, "update_status", move |mut record| {
            record.status = status.clone();
            Ok(record)
        })
        .await
    }

    /// Record deletion intent. The record stays active until its finalizer
    /// is removed.
    pub async fn mark_deletion_intent(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
    ) -> StoreResult<Record<K>> {
        self.write(tenant_id, key, expected_version, false, "delete", |mut record| {
            if record.metadata.deletion_timestamp.is_none() {
                record.metadata.deletion_timestamp = Some(Utc::now());
            }
            record.status.phase = K::Phase::DELETING;
            Ok(record)
        })
        .await
    }

    /// Finalize a record whose deletion was requested. It disappears from
    /// reads and shows up in the change feed as deleted.
    pub async fn remove_finalizer(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
    ) -> StoreResult<Record<K>> {
        self.write(tenant_id, key, expected_version, true, "finalize", |record| {
            if record.metadata.deletion_timestamp.is_none() {
                return Err(StoreError::FailedPrecondition(format!(
                    "deletion of {} {} has not been requested",
                    K::KIND,
                    record.metadata.name
                )));
            }
            Ok(record)
        })
        .await
    }

    async fn write<F>(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
        finalize: bool,
        op: &'static str,
        transform: F,
    ) -> StoreResult<Record<K>>
    where
        F: Fn(Record<K>) -> StoreResult<Record<K>> + Send + Sync,
    {
        let pinned = expected_version.is_some();
        let outcome = retry_with_backoff(
            &self.cas_retry,
            "record_update",
            |err: &Attempt| !pinned && matches!(err, Attempt::Conflict),
            |_| self.attempt(tenant_id, key, expected_version, finalize, &transform),
        )
        .await;
        match outcome {
            Ok(record) => {
                metrics::counter!(observability::RECORD_WRITES, "table" => K::TABLE.as_str(), "op" => op)
                    .increment(1);
                Ok(record)
            }
            Err(Attempt::Failed(err)) => Err(err),
            Err(Attempt::Conflict) => Err(StoreError::FailedPrecondition(format!(
                "{} was modified concurrently",
                K::KIND
            ))),
        }
    }

    async fn attempt<F>(
        &self,
        tenant_id: &str,
        key: &RecordKey,
        expected_version: Option<i64>,
        finalize: bool,
        transform: &F,
    ) -> Result<Record<K>, Attempt>
    where
        F: Fn(Record<K>) -> StoreResult<Record<K>> + Send + Sync,
    {
        let current = self.get(tenant_id, key).await.map_err(Attempt::Failed)?;
        let version = current.metadata.resource_version;
        if let Some(expected) = expected_version {
            if expected != version {
                return Err(Attempt::Failed(StoreError::FailedPrecondition(format!(
                    "resource version mismatch: expected {expected}, found {version}"
                ))));
            }
        }

        let next = transform(current.clone()).map_err(Attempt::Failed)?;
        ensure_identity_unchanged(&current.metadata, &next.metadata).map_err(Attempt::Failed)?;
        let value = serde_json::to_value(&next)
            .map_err(|err| Attempt::Failed(StoreError::from(err)))?;
        let written = self
            .backend
            .compare_and_swap(
                K::TABLE,
                tenant_id,
                current.metadata.resource_id,
                version,
                RowUpdate { value, finalize },
            )
            .await
            .map_err(Attempt::Failed)?;
        match written {
            Some(row) => Self::decode(row).map_err(Attempt::Failed),
            None => {
                metrics::counter!(observability::CAS_CONFLICTS, "table" => K::TABLE.as_str())
                    .increment(1);
                Err(Attempt::Conflict)
            }
        }
    }

    pub fn to_new_row(record: &Record<K>) -> StoreResult<NewRow> {
        Ok(NewRow {
            tenant_id: record.metadata.tenant_id.clone(),
            resource_id: record.metadata.resource_id,
            name: record.metadata.name.clone(),
            value: serde_json::to_value(record)?,
        })
    }

    /// Row columns are authoritative over the copies inside the JSON value.
    pub fn decode(row: StoredRow) -> StoreResult<Record<K>> {
        let mut record: Record<K> = serde_json::from_value(row.value)?;
        record.metadata.tenant_id = row.tenant_id;
        record.metadata.resource_id = row.resource_id;
        record.metadata.name = row.name;
        record.metadata.resource_version = row.resource_version;
        record.metadata.deleted_timestamp = row.deleted_timestamp;
        Ok(record)
    }
}

fn not_found<K: ResourceKind>(key: &RecordKey) -> StoreError {
    match key {
        RecordKey::Id(id) => StoreError::NotFound(format!("{} {id}", K::KIND)),
        RecordKey::Name(name) => StoreError::NotFound(format!("{} {name}", K::KIND)),
    }
}

fn ensure_identity_unchanged(current: &Metadata, next: &Metadata) -> StoreResult<()> {
    let changed = if current.tenant_id != next.tenant_id {
        Some("tenantId")
    } else if current.resource_id != next.resource_id {
        Some("resourceId")
    } else if current.name != next.name {
        Some("name")
    } else if current.creation_timestamp != next.creation_timestamp {
        Some("creationTimestamp")
    } else if current.deletion_timestamp.is_some()
        && current.deletion_timestamp != next.deletion_timestamp
    {
        Some("deletionTimestamp")
    } else {
        None
    };
    match changed {
        Some(field) => Err(StoreError::InvalidArgument(format!(
            "metadata.{field} is immutable"
        ))),
        None => Ok(()),
    }
}
