use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, internal_error, not_found};

/// Audit records are sanitized on write, so they are returned as stored.
pub async fn get_log(Path(id): Path<String>, State(state): State<AppState>) -> ApiResponse {
    match state.store.get_invocation_log(&id).await {
        Ok(Some(log)) => (StatusCode::OK, Json(json!({ "success": true, "log": log }))),
        Ok(None) => not_found("Invocation log"),
        Err(e) => internal_error(e),
    }
}
