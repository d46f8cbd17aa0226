//! HTTP API request/response types.
//!
//! # Purpose
//! Payload shapes shared by the resource, change-feed and system endpoints.
//! Kind-generic payloads carry `serde(bound = "")` like the records they wrap.
use crate::compute::{InstanceGroup, NewInstanceGroup};
use crate::model::{Instance, InstanceSpec, NewResource, Record, ResourceKind, ResourceStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct FeatureFlags {
    pub durable_storage: bool,
    /// False when instances must be created with explicit placement.
    pub scheduler: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct SystemInfo {
    pub region_id: String,
    pub api_version: String,
    pub storage_backend: String,
    pub features: FeatureFlags,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthStatus {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct Region {
    pub region_id: String,
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ListResponse<K: ResourceKind> {
    pub items: Vec<Record<K>>,
}

/// Labels and/or spec replacement. Omitted fields are left unchanged.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct UpdateRequest<K: ResourceKind> {
    #[serde(default)]
    pub resource_version: Option<i64>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub spec: Option<K::Spec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct StatusUpdateRequest<K: ResourceKind> {
    #[serde(default)]
    pub resource_version: Option<i64>,
    pub status: ResourceStatus<K::Phase>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreateRequest {
    pub instances: Vec<NewResource<Instance>>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Batch create from another control-plane service. Instances either all
/// carry `clusterId` and `nodeId` or none do.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateBatchCreateRequest {
    pub instances: Vec<NewResource<Instance>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_quota_check: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateInstanceGroupRequest {
    #[serde(flatten)]
    pub group: NewInstanceGroup,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_quota_check: bool,
}

/// Private group create result: the members and where they landed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupPlacement {
    pub group: InstanceGroup,
    pub instances: Vec<Record<Instance>>,
    pub cluster_ids: Vec<String>,
    pub node_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceGroupList {
    pub items: Vec<InstanceGroup>,
}

/// Spec applied to every member. Only `sshPublicKeyNames` may differ from
/// the current one.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceGroupUpdateRequest {
    pub spec: InstanceSpec,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpRequest {
    pub instance_count: u32,
}
