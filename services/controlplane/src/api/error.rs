//! API error types and helpers.
//!
//! # Purpose
//! Every handler returns [`ApiError`]. Store errors are translated in one
//! place, [`api_store_error`], so a given failure always produces the same
//! status code and `code` string.
//!
//! # Security considerations
//! - Internal errors log details server-side but return generic messages.
use crate::api::types::ErrorResponse;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Structured API error returned by handlers.
///
/// `status` must match the semantics of `body.code`.
///
/// ```rust
/// use axum::http::StatusCode;
/// use controlplane::api::error::ApiError;
/// use controlplane::api::types::ErrorResponse;
///
/// let err = ApiError {
///     status: StatusCode::NOT_FOUND,
///     body: ErrorResponse {
///         code: "not_found".to_string(),
///         message: "missing".to_string(),
///         request_id: None,
///     },
/// };
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            request_id: None,
        },
    }
}

pub fn api_not_found(message: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, "not_found", message)
}

/// Build a 409 Conflict error with a caller-provided code.
pub fn api_conflict(code: &str, message: &str) -> ApiError {
    api_error(StatusCode::CONFLICT, code, message)
}

/// Build a 500 Internal Server Error from a store error.
///
/// Logs the store error and returns the given generic message.
pub fn api_internal(message: &str, err: &StoreError) -> ApiError {
    tracing::error!(error = ?err, "controlplane storage error");
    api_internal_message(message)
}

pub fn api_internal_message(message: &str) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Build a 400 Bad Request validation error.
pub fn api_validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// Translate a store error into its HTTP shape.
///
/// Domain errors carry their message to the client. `Unexpected` errors are
/// logged and answered with a generic message.
pub fn api_store_error(err: &StoreError) -> ApiError {
    match err {
        StoreError::InvalidArgument(message) => api_validation_error(message),
        StoreError::NotFound(message) => api_not_found(message),
        StoreError::AlreadyExists(message) => api_conflict("already_exists", message),
        StoreError::FailedPrecondition(message) => {
            api_error(StatusCode::PRECONDITION_FAILED, "failed_precondition", message)
        }
        StoreError::ResourceExhausted(message) => {
            api_error(StatusCode::TOO_MANY_REQUESTS, "resource_exhausted", message)
        }
        StoreError::OutOfRange(message) => {
            api_error(StatusCode::BAD_REQUEST, "out_of_range", message)
        }
        StoreError::Unexpected(_) => api_internal("internal error", err),
    }
}
