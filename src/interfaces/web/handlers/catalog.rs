use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, internal_error, not_found};

pub async fn list_capabilities(State(state): State<AppState>) -> ApiResponse {
    match state.store.list_capabilities().await {
        Ok(capabilities) => (
            StatusCode::OK,
            Json(json!({ "success": true, "capabilities": capabilities })),
        ),
        Err(e) => internal_error(e),
    }
}

pub async fn get_capability(Path(id): Path<String>, State(state): State<AppState>) -> ApiResponse {
    match state.store.get_capability(&id).await {
        Ok(Some(capability)) => (
            StatusCode::OK,
            Json(json!({ "success": true, "capability": capability })),
        ),
        Ok(None) => not_found("Capability"),
        Err(e) => internal_error(e),
    }
}
