use axum::{Json, extract::State, http::StatusCode};
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, error_response};
use crate::core::orchestrator::InvokeRequest;

pub async fn invoke_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<InvokeRequest>,
) -> ApiResponse {
    if payload.capability_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "capabilityId is required", "kind": "invalid_request" })),
        );
    }
    match state.scheduler.invoke(payload).await {
        Ok(response) => {
            let mut body = serde_json::to_value(&response).unwrap_or_default();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("success".into(), json!(true));
            }
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_response(&e),
    }
}
