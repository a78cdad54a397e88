use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use super::super::AppState;

pub async fn serve_file(Path(key): Path<String>, State(state): State<AppState>) -> Response {
    let Some(path) = state.storage.object_path(&key) else {
        return (StatusCode::BAD_REQUEST, "invalid object key").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [
                    (header::CONTENT_TYPE, mime.to_string()),
                    (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "404 Not Found").into_response()
        }
        Err(e) => {
            tracing::warn!(key = %key, "Failed to read stored object: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
