pub mod catalog;
pub mod files;
pub mod invoke;
pub mod logs;
pub mod tasks;

use axum::{Json, http::StatusCode};
use serde_json::{Value, json};

use crate::core::error::InvokeError;

pub(crate) type ApiResponse = (StatusCode, Json<Value>);

pub(crate) fn status_for(err: &InvokeError) -> StatusCode {
    match err {
        InvokeError::InvalidRequest(_) | InvokeError::Config(_) => StatusCode::BAD_REQUEST,
        InvokeError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        InvokeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        InvokeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        InvokeError::Transient(_) | InvokeError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        InvokeError::Storage(_) | InvokeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &InvokeError) -> ApiResponse {
    (
        status_for(err),
        Json(json!({ "success": false, "error": err.to_string(), "kind": err.kind() })),
    )
}

pub(crate) fn not_found(what: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": format!("{what} not found") })),
    )
}

pub(crate) fn internal_error(err: anyhow::Error) -> ApiResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": err.to_string(), "kind": "internal" })),
    )
}
