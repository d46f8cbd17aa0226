//! Instance group handlers.
//!
//! Groups have no row of their own; every handler works on the member
//! instances through [`InstanceGroups`](crate::compute::InstanceGroups).
use crate::api::error::{ApiError, api_store_error};
use crate::api::instances::{created_status, dry_run};
use crate::api::parse_resource_id;
use crate::api::types::{
    ErrorResponse, InstanceGroupList, InstanceGroupPlacement, InstanceGroupUpdateRequest,
    PrivateInstanceGroupRequest, ScaleUpRequest,
};
use crate::app::AppState;
use crate::compute::{CreateOptions, InstanceGroup, NewInstanceGroup, ScaleStatus};
use crate::model::{Instance, Record, RecordKey};
use crate::store::StoreError;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use std::collections::{BTreeSet, HashMap};

/// Summary of the records a group operation returned.
fn summary(tenant_id: &str, name: &str, members: &[Record<Instance>]) -> Result<InstanceGroup, ApiError> {
    InstanceGroup::from_members(tenant_id, name, members)
        .ok_or_else(|| api_store_error(&StoreError::NotFound(format!("instance group {name}"))))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/instance-groups",
    tag = "instance-groups",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("dry_run" = Option<bool>, Query, description = "Run every check without writing")
    ),
    request_body = NewInstanceGroup,
    responses(
        (status = 201, description = "Group members scheduled and stored", body = InstanceGroup),
        (status = 200, description = "Dry run succeeded", body = InstanceGroup),
        (status = 400, description = "Invalid name, count or quota exceeded", body = ErrorResponse),
        (status = 409, description = "Group or member name already in use", body = ErrorResponse)
    )
)]
pub(crate) async fn create_group(
    Path(tenant_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    Json(body): Json<NewInstanceGroup>,
) -> Result<(StatusCode, Json<InstanceGroup>), ApiError> {
    let dry_run = dry_run(&params)?;
    let name = body.name.clone();
    let members = state
        .groups
        .create(&tenant_id, body, CreateOptions::tenant(dry_run))
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok((created_status(dry_run), Json(summary(&tenant_id, &name, &members)?)))
}

pub(crate) async fn search_groups(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<InstanceGroupList>, ApiError> {
    let items = state
        .groups
        .search(&tenant_id)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(InstanceGroupList { items }))
}

pub(crate) async fn get_group(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let group = state
        .groups
        .get(&tenant_id, &name)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(group))
}

pub(crate) async fn update_group(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<InstanceGroupUpdateRequest>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let members = state
        .groups
        .update(&tenant_id, &name, body.spec)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(summary(&tenant_id, &name, &members)?))
}

pub(crate) async fn delete_group(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<InstanceGroup>, ApiError> {
    let members = state
        .groups
        .delete(&tenant_id, &name)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(summary(&tenant_id, &name, &members)?))
}

pub(crate) async fn delete_member_by_name(
    Path((tenant_id, name, member)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Record<Instance>>, ApiError> {
    delete_member(&state, &tenant_id, &name, RecordKey::Name(member)).await
}

pub(crate) async fn delete_member_by_id(
    Path((tenant_id, name, resource_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Record<Instance>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    delete_member(&state, &tenant_id, &name, key).await
}

async fn delete_member(
    state: &AppState,
    tenant_id: &str,
    name: &str,
    key: RecordKey,
) -> Result<Json<Record<Instance>>, ApiError> {
    let record = state
        .groups
        .delete_member(tenant_id, name, &key)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(record))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/instance-groups/{name}/scale-up",
    tag = "instance-groups",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("name" = String, Path, description = "Instance group name")
    ),
    request_body = ScaleUpRequest,
    responses(
        (status = 200, description = "Group has the requested size", body = ScaleStatus),
        (status = 400, description = "Invalid count, scale down or quota exceeded", body = ErrorResponse),
        (status = 404, description = "Group unknown or being deleted", body = ErrorResponse)
    )
)]
pub(crate) async fn scale_up(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<ScaleUpRequest>,
) -> Result<Json<ScaleStatus>, ApiError> {
    let status = state
        .groups
        .scale_up(&tenant_id, &name, body.instance_count)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(status))
}

/// Group create for other control-plane services. Answers with the
/// clusters and nodes the members were placed on.
pub(crate) async fn private_create_group(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PrivateInstanceGroupRequest>,
) -> Result<(StatusCode, Json<InstanceGroupPlacement>), ApiError> {
    let name = body.group.name.clone();
    let options = CreateOptions::internal(body.dry_run, body.skip_quota_check);
    let instances = state
        .groups
        .create(&tenant_id, body.group, options)
        .await
        .map_err(|err| api_store_error(&err))?;

    let cluster_ids: BTreeSet<String> =
        instances.iter().filter_map(|i| i.spec.cluster_id.clone()).collect();
    let node_ids: BTreeSet<String> =
        instances.iter().filter_map(|i| i.spec.node_id.clone()).collect();
    let placement = InstanceGroupPlacement {
        group: summary(&tenant_id, &name, &instances)?,
        cluster_ids: cluster_ids.into_iter().collect(),
        node_ids: node_ids.into_iter().collect(),
        instances,
    };
    Ok((created_status(body.dry_run), Json(placement)))
}
