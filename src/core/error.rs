use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;

/// Classified failure of an invocation. The variant decides what the caller
/// does next: retry, rotate the credential, repair parameters or give up.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{vendor} rejected the request: {message}")]
    Validation { vendor: String, message: String },

    #[error("{vendor} rate limited the request")]
    RateLimited {
        vendor: String,
        retry_after: Option<Duration>,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{vendor} failed: {message}")]
    Upstream { vendor: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InvokeError {
    /// Stable machine-readable name, returned to synchronous callers as `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::Config(_) => "config",
            InvokeError::InvalidRequest(_) => "invalid_request",
            InvokeError::Validation { .. } => "validation",
            InvokeError::RateLimited { .. } => "rate_limited",
            InvokeError::Transient(_) => "transient",
            InvokeError::Timeout(_) => "timeout",
            InvokeError::Upstream { .. } => "upstream",
            InvokeError::Storage(_) => "storage",
            InvokeError::Internal(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, InvokeError::Transient(_))
    }

    pub fn upstream(vendor: &str, message: impl Into<String>) -> Self {
        InvokeError::Upstream {
            vendor: vendor.to_string(),
            message: message.into(),
        }
    }

    pub fn from_reqwest(vendor: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InvokeError::Timeout(format!("{vendor} request timed out: {err}"))
        } else if err.is_decode() {
            InvokeError::upstream(vendor, format!("unreadable response: {err}"))
        } else {
            InvokeError::Transient(format!("{vendor} request failed: {err}"))
        }
    }

    /// Map a non-2xx vendor response onto the taxonomy.
    pub fn from_status(vendor: &str, status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let message = extract_error_message(body);
        match status.as_u16() {
            429 => InvokeError::RateLimited {
                vendor: vendor.to_string(),
                retry_after: parse_retry_after(headers),
            },
            400 | 422 => InvokeError::Validation {
                vendor: vendor.to_string(),
                message,
            },
            401 | 403 => {
                InvokeError::upstream(vendor, format!("authentication failed ({status}): {message}"))
            }
            408 | 500..=599 => {
                InvokeError::Transient(format!("{vendor} returned {status}: {message}"))
            }
            _ => InvokeError::upstream(vendor, format!("unexpected status {status}: {message}")),
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Best-effort human message out of a vendor error body.
pub fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let candidates = [
            "/error/message",
            "/error",
            "/message",
            "/detail",
            "/msg",
            "/data/message",
        ];
        for pointer in candidates {
            match json.pointer(pointer) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(v @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)))
                    if pointer == "/detail" =>
                {
                    return v.to_string();
                }
                _ => {}
            }
        }
    }

    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_codes_map_to_taxonomy() {
        let headers = HeaderMap::new();
        assert_eq!(
            InvokeError::from_status("acme", StatusCode::TOO_MANY_REQUESTS, &headers, "").kind(),
            "rate_limited"
        );
        assert_eq!(
            InvokeError::from_status("acme", StatusCode::UNPROCESSABLE_ENTITY, &headers, "").kind(),
            "validation"
        );
        assert_eq!(
            InvokeError::from_status("acme", StatusCode::UNAUTHORIZED, &headers, "").kind(),
            "upstream"
        );
        assert!(
            InvokeError::from_status("acme", StatusCode::BAD_GATEWAY, &headers, "").is_transient()
        );
    }

    #[test]
    fn retry_after_seconds_are_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        match InvokeError::from_status("acme", StatusCode::TOO_MANY_REQUESTS, &headers, "") {
            InvokeError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_message_prefers_nested_json_fields() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"bad aspect_ratio"}}"#),
            "bad aspect_ratio"
        );
        assert_eq!(extract_error_message(r#"{"msg":"nope"}"#), "nope");
        assert_eq!(extract_error_message("plain text"), "plain text");
        assert_eq!(extract_error_message("  "), "empty response body");
    }
}
