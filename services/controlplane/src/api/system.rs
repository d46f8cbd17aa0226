//! System/health API handlers.
//!
//! # Purpose
//! Service identity, capability flags and a storage-backed health check.
//!
//! # Key invariants
//! - Health checks are fast and side-effect free.
//! - System info is built from in-memory state only.
use crate::api::error::{ApiError, api_internal};
use crate::api::types::{ErrorResponse, HealthStatus, SystemInfo};
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

#[utoipa::path(
    get,
    path = "/v1/system/info",
    tag = "system",
    responses(
        (status = 200, description = "Region identity and capabilities", body = SystemInfo)
    )
)]
/// Return region identity, storage backend and feature flags.
pub(crate) async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    Json(SystemInfo {
        region_id: state.region.region_id.clone(),
        api_version: state.api_version.clone(),
        storage_backend: state.backend.backend_name().to_string(),
        features: state.features.clone(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/system/health",
    tag = "system",
    responses(
        (status = 200, description = "Control plane health", body = HealthStatus),
        (status = 500, description = "Storage unavailable", body = ErrorResponse)
    )
)]
/// Checks the record backend.
///
/// # Errors
/// - Returns 500 if the storage health check fails.
pub(crate) async fn system_health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, ApiError> {
    if let Err(err) = state.backend.health_check().await {
        return Err(api_internal("storage unavailable", &err));
    }
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
    }))
}
