use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, error_response, internal_error, not_found};
use crate::core::orchestrator::InvokeRequest;
use crate::core::scheduler::types::TaskSnapshot;

pub async fn enqueue_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<InvokeRequest>,
) -> ApiResponse {
    match state.scheduler.enqueue(payload).await {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "taskId": handle.task_id, "status": handle.status })),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn get_task_endpoint(Path(id): Path<String>, State(state): State<AppState>) -> ApiResponse {
    match state.scheduler.get_task(&id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!({ "success": true, "task": task }))),
        Ok(None) => not_found("Task"),
        Err(e) => error_response(&e),
    }
}

pub async fn recheck_task_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.scheduler.recheck(&id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!({ "success": true, "task": task }))),
        Ok(None) => not_found("Task"),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
}

pub async fn list_tasks_endpoint(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.store.list_tasks(limit).await {
        Ok(tasks) => {
            let tasks: Vec<TaskSnapshot> = tasks.iter().map(TaskSnapshot::from).collect();
            (StatusCode::OK, Json(json!({ "success": true, "tasks": tasks })))
        }
        Err(e) => internal_error(e),
    }
}
