//! Instance creation handlers.
//!
//! Instances are not created through the generic resource handler: every
//! create goes through the orchestrator for quota, naming, vnet and placement
//! checks. Reads, updates and deletes use the generic handlers.
//!
//! Tenant routes always count against quota and are always scheduled. The
//! private batch route is mounted on the internal listener only; there the
//! caller may skip the quota check and pass placement itself.
use crate::api::error::{ApiError, api_store_error, api_validation_error};
use crate::api::types::{BatchCreateRequest, ErrorResponse, PrivateBatchCreateRequest};
use crate::app::AppState;
use crate::compute::CreateOptions;
use crate::model::{Instance, NewResource, Record};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use std::collections::HashMap;

pub(crate) fn dry_run(params: &HashMap<String, String>) -> Result<bool, ApiError> {
    match params.get("dry_run").map(String::as_str) {
        None => Ok(false),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(_) => Err(api_validation_error("dry_run must be true or false")),
    }
}

/// 201 when written, 200 for a dry run.
pub(crate) fn created_status(dry_run: bool) -> StatusCode {
    if dry_run {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/instances",
    tag = "instances",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("dry_run" = Option<bool>, Query, description = "Run every check without writing")
    ),
    responses(
        (status = 201, description = "Instance scheduled and stored"),
        (status = 200, description = "Dry run succeeded"),
        (status = 400, description = "Invalid request or quota exceeded", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse),
        (status = 429, description = "No capacity for the instance", body = ErrorResponse)
    )
)]
pub(crate) async fn create_instance(
    Path(tenant_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    Json(body): Json<NewResource<Instance>>,
) -> Result<(StatusCode, Json<Record<Instance>>), ApiError> {
    let dry_run = dry_run(&params)?;
    let record = state
        .orchestrator
        .create(&tenant_id, body, CreateOptions::tenant(dry_run))
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok((created_status(dry_run), Json(record)))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/instances/batch",
    tag = "instances",
    params(("tenant_id" = String, Path, description = "Tenant identifier")),
    responses(
        (status = 201, description = "All instances scheduled and stored"),
        (status = 200, description = "Dry run succeeded"),
        (status = 400, description = "Invalid request or quota exceeded", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse),
        (status = 429, description = "No capacity for the batch", body = ErrorResponse)
    )
)]
pub(crate) async fn batch_create(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<BatchCreateRequest>,
) -> Result<(StatusCode, Json<Vec<Record<Instance>>>), ApiError> {
    let records = state
        .orchestrator
        .create_batch(&tenant_id, body.instances, CreateOptions::tenant(body.dry_run))
        .await
        .map_err(|err| api_store_error(&err))?;
    tracing::info!(
        tenant_id = %tenant_id,
        count = records.len(),
        dry_run = body.dry_run,
        "instance batch accepted"
    );
    Ok((created_status(body.dry_run), Json(records)))
}

#[utoipa::path(
    post,
    path = "/v1/private/tenants/{tenant_id}/instances/batch",
    tag = "private",
    params(("tenant_id" = String, Path, description = "Tenant identifier")),
    responses(
        (status = 201, description = "All instances placed and stored"),
        (status = 200, description = "Dry run succeeded"),
        (status = 400, description = "Invalid request, partial placement or quota exceeded", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse)
    )
)]
pub(crate) async fn private_batch_create(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PrivateBatchCreateRequest>,
) -> Result<(StatusCode, Json<Vec<Record<Instance>>>), ApiError> {
    let options = CreateOptions::internal(body.dry_run, body.skip_quota_check);
    let records = state
        .orchestrator
        .create_batch(&tenant_id, body.instances, options)
        .await
        .map_err(|err| api_store_error(&err))?;
    tracing::info!(
        tenant_id = %tenant_id,
        count = records.len(),
        dry_run = body.dry_run,
        skip_quota_check = body.skip_quota_check,
        "private instance batch accepted"
    );
    Ok((created_status(body.dry_run), Json(records)))
}
