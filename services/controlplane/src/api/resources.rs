//! Resource CRUD handlers shared by every kind.
//!
//! # Purpose
//! Each handler is generic over [`ResourceKind`] and is mounted once per kind
//! by the router. Records are addressed either by id (`/id/{resource_id}`) or
//! by name (`/name/{name}`) within the tenant from the path.
use crate::api::error::{ApiError, api_store_error};
use crate::api::types::{ListResponse, StatusUpdateRequest, UpdateRequest};
use crate::api::{optional_i64, parse_resource_id, search_filter};
use crate::app::AppState;
use crate::model::{NewResource, Record, RecordKey, ResourceKind};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use std::collections::HashMap;

const RESOURCE_VERSION: &str = "resource_version";

pub(crate) async fn create<K: ResourceKind>(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<NewResource<K>>,
) -> Result<(StatusCode, Json<Record<K>>), ApiError> {
    let record = state
        .records::<K>()
        .create(&tenant_id, body)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(crate) async fn search<K: ResourceKind>(
    Path(tenant_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Json<ListResponse<K>>, ApiError> {
    let filter = search_filter(&params, &[])?;
    let items = state
        .records::<K>()
        .search(&tenant_id, &filter)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok(Json(ListResponse { items }))
}

pub(crate) async fn get_by_id<K: ResourceKind>(
    Path((tenant_id, resource_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Record<K>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    get::<K>(&state, &tenant_id, &key).await
}

pub(crate) async fn get_by_name<K: ResourceKind>(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Record<K>>, ApiError> {
    get::<K>(&state, &tenant_id, &RecordKey::Name(name)).await
}

async fn get<K: ResourceKind>(
    state: &AppState,
    tenant_id: &str,
    key: &RecordKey,
) -> Result<Json<Record<K>>, ApiError> {
    state
        .records::<K>()
        .get(tenant_id, key)
        .await
        .map(Json)
        .map_err(|err| api_store_error(&err))
}

pub(crate) async fn update_by_id<K: ResourceKind>(
    Path((tenant_id, resource_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<UpdateRequest<K>>,
) -> Result<Json<Record<K>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    update::<K>(&state, &tenant_id, &key, body).await
}

pub(crate) async fn update_by_name<K: ResourceKind>(
    Path((tenant_id, name)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<UpdateRequest<K>>,
) -> Result<Json<Record<K>>, ApiError> {
    update::<K>(&state, &tenant_id, &RecordKey::Name(name), body).await
}

async fn update<K: ResourceKind>(
    state: &AppState,
    tenant_id: &str,
    key: &RecordKey,
    body: UpdateRequest<K>,
) -> Result<Json<Record<K>>, ApiError> {
    state
        .records::<K>()
        .update_fields(tenant_id, key, body.resource_version, body.labels, body.spec)
        .await
        .map(Json)
        .map_err(|err| api_store_error(&err))
}

pub(crate) async fn update_status<K: ResourceKind>(
    Path((tenant_id, resource_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<StatusUpdateRequest<K>>,
) -> Result<Json<Record<K>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    state
        .records::<K>()
        .update_status(&tenant_id, &key, body.resource_version, body.status)
        .await
        .map(Json)
        .map_err(|err| api_store_error(&err))
}

/// Record deletion intent. The record stays readable until a controller
/// removes its finalizer.
pub(crate) async fn delete_by_id<K: ResourceKind>(
    Path((tenant_id, resource_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Json<Record<K>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    delete::<K>(&state, &tenant_id, &key, &params).await
}

pub(crate) async fn delete_by_name<K: ResourceKind>(
    Path((tenant_id, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Json<Record<K>>, ApiError> {
    delete::<K>(&state, &tenant_id, &RecordKey::Name(name), &params).await
}

async fn delete<K: ResourceKind>(
    state: &AppState,
    tenant_id: &str,
    key: &RecordKey,
    params: &HashMap<String, String>,
) -> Result<Json<Record<K>>, ApiError> {
    let expected = optional_i64(params, RESOURCE_VERSION)?;
    state
        .records::<K>()
        .mark_deletion_intent(tenant_id, key, expected)
        .await
        .map(Json)
        .map_err(|err| api_store_error(&err))
}

pub(crate) async fn remove_finalizer<K: ResourceKind>(
    Path((tenant_id, resource_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Json<Record<K>>, ApiError> {
    let key = RecordKey::Id(parse_resource_id(&resource_id)?);
    let expected = optional_i64(&params, RESOURCE_VERSION)?;
    let record = state
        .records::<K>()
        .remove_finalizer(&tenant_id, &key, expected)
        .await
        .map_err(|err| api_store_error(&err))?;
    tracing::info!(
        tenant_id = %tenant_id,
        kind = K::KIND,
        resource_id = %record.metadata.resource_id,
        "record finalized"
    );
    Ok(Json(record))
}
