//! Generic resource record shared by every kind.
//!
//! # Purpose
//! A record is `{metadata, spec, status}`. Metadata and status shapes are the
//! same for every kind; spec and the status phase vary. [`ResourceKind`] ties a
//! zero-sized marker type to its table, collection path, spec type and the
//! rules the record engine applies on create and update.
use crate::store::Table;
use chrono::{DateTime, Utc};
use nimbus_common::ids::ResourceId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;

pub trait LifecyclePhase:
    Serialize + DeserializeOwned + Clone + Copy + Debug + PartialEq + Default + Send + Sync + 'static
{
    /// Phase a record enters when deletion is requested.
    const DELETING: Self;
}

pub trait ResourceKind: Clone + Copy + Debug + PartialEq + Send + Sync + 'static {
    type Spec: Serialize + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync + 'static;
    type Phase: LifecyclePhase;

    const TABLE: Table;
    /// Path segment used by the HTTP API, e.g. `instances`.
    const COLLECTION: &'static str;
    /// Human readable kind name used in error messages.
    const KIND: &'static str;

    fn validate_spec(spec: &Self::Spec) -> Result<(), String> {
        let _ = spec;
        Ok(())
    }

    /// Merge a requested spec into the current one. Kinds with immutable
    /// fields reject changes to them here.
    fn apply_spec_update(current: &Self::Spec, requested: Self::Spec) -> Result<Self::Spec, String> {
        let _ = current;
        Ok(requested)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub tenant_id: String,
    pub resource_id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: DateTime<Utc>,
    /// Deletion intent. Set once and never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Finalization time; mirrors the row column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_version: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct ResourceStatus<P: LifecyclePhase> {
    #[serde(default)]
    pub phase: P,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(bound = "")]
pub struct Record<K: ResourceKind> {
    pub metadata: Metadata,
    pub spec: K::Spec,
    #[serde(default)]
    pub status: ResourceStatus<K::Phase>,
}

/// Create request for one record. Missing id and name are filled in by the
/// record engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct NewResource<K: ResourceKind> {
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: K::Spec,
}

impl<K: ResourceKind> NewResource<K> {
    pub fn new(spec: K::Spec) -> Self {
        Self {
            resource_id: None,
            name: None,
            labels: BTreeMap::new(),
            spec,
        }
    }

    pub fn named(name: impl Into<String>, spec: K::Spec) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(spec)
        }
    }
}

/// Equality filter over labels and top-level spec fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub labels: BTreeMap<String, String>,
    pub spec: Map<String, Value>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.spec.is_empty()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_spec_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.spec.insert(field.into(), value);
        self
    }

    /// JSON document the stored value must contain.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        if !self.labels.is_empty() {
            let labels: Map<String, Value> = self
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let mut metadata = Map::new();
            metadata.insert("labels".to_string(), Value::Object(labels));
            doc.insert("metadata".to_string(), Value::Object(metadata));
        }
        if !self.spec.is_empty() {
            doc.insert("spec".to_string(), Value::Object(self.spec.clone()));
        }
        Value::Object(doc)
    }
}
