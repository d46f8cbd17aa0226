//! Port reservation handler. Ports go through the reserver so the subnet,
//! address and MAC are checked with the subnet locked.
use crate::api::error::{ApiError, api_store_error};
use crate::api::types::ErrorResponse;
use crate::app::AppState;
use crate::model::{NewResource, Port, Record};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/ports",
    tag = "ports",
    params(("tenant_id" = String, Path, description = "Tenant identifier")),
    responses(
        (status = 201, description = "Port reserved"),
        (status = 200, description = "A port with this MAC already exists and is returned"),
        (status = 400, description = "Invalid subnet or address", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse)
    )
)]
pub(crate) async fn reserve_port(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<NewResource<Port>>,
) -> Result<(StatusCode, Json<Record<Port>>), ApiError> {
    let reservation = state
        .ports
        .reserve(&tenant_id, body)
        .await
        .map_err(|err| api_store_error(&err))?;
    let status = if reservation.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(reservation.port)))
}
