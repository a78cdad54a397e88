use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::handlers::{catalog, files, invoke, logs, tasks};
use super::{AppState, sse_logs_endpoint};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState) -> Router {
    let api_port = state.api_port;
    Router::new()
        .route("/api/invoke", post(invoke::invoke_endpoint))
        .route(
            "/api/tasks",
            get(tasks::list_tasks_endpoint).post(tasks::enqueue_endpoint),
        )
        .route("/api/tasks/{id}", get(tasks::get_task_endpoint))
        .route("/api/tasks/{id}/recheck", post(tasks::recheck_task_endpoint))
        .route("/api/capabilities", get(catalog::list_capabilities))
        .route("/api/capabilities/{id}", get(catalog::get_capability))
        .route("/api/logs/{id}", get(logs::get_log))
        .route("/api/events", get(sse_logs_endpoint))
        .route("/files/{key}", get(files::serve_file))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
