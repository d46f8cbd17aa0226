//! Subnet creation handler. Subnets are allocated inside their VPC's address
//! range, so creates go through the allocator instead of a plain insert.
use crate::api::error::{ApiError, api_store_error};
use crate::api::types::ErrorResponse;
use crate::app::AppState;
use crate::model::{NewResource, Record, Subnet};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/subnets",
    tag = "subnets",
    params(("tenant_id" = String, Path, description = "Tenant identifier")),
    responses(
        (status = 201, description = "Subnet allocated"),
        (status = 400, description = "Invalid block, unknown VPC or overlap", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse)
    )
)]
pub(crate) async fn create_subnet(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<NewResource<Subnet>>,
) -> Result<(StatusCode, Json<Record<Subnet>>), ApiError> {
    let record = state
        .allocator
        .create(&tenant_id, body)
        .await
        .map_err(|err| api_store_error(&err))?;
    Ok((StatusCode::CREATED, Json(record)))
}
