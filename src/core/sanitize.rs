use serde_json::{Map, Value};

const MASK: &str = "***";
const SECRET_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "authorization",
    "token",
    "access_token",
    "refresh_token",
    "secret",
    "secret_key",
    "access_key",
    "password",
    "credential",
    "signature",
];
const SECRET_SUFFIXES: &[&str] = &["_secret", "_token", "_password", "_api_key"];

/// Strings at least this long made only of base64 characters are treated as payloads.
const BASE64_MIN_LEN: usize = 256;

/// Copy of `value` fit for the audit log: secret-named keys masked, data URIs
/// and long base64 blobs replaced by a size marker.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                if is_secret_key(key) && !v.is_null() {
                    out.insert(key.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(key.clone(), sanitize(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::String(s) => Value::String(scrub_string(s).unwrap_or_else(|| s.clone())),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase().replace('-', "_");
    SECRET_KEYS.contains(&key.as_str()) || SECRET_SUFFIXES.iter().any(|s| key.ends_with(s))
}

fn scrub_string(s: &str) -> Option<String> {
    if let Some(rest) = s.strip_prefix("data:")
        && let Some((meta, payload)) = rest.split_once(',')
    {
        let mime = meta.split(';').next().unwrap_or_default();
        return Some(format!(
            "<inline {} omitted, {} bytes>",
            if mime.is_empty() { "data" } else { mime },
            payload.len() * 3 / 4
        ));
    }

    if s.len() >= BASE64_MIN_LEN && looks_like_base64(s) {
        return Some(format!("<base64 omitted, {} chars>", s.len()));
    }
    None
}

fn looks_like_base64(s: &str) -> bool {
    s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_' | b'\n' | b'\r')
    })
}

/// True if any string in the tree still carries an inline payload.
pub fn contains_inline_payload(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.values().any(contains_inline_payload),
        Value::Array(items) => items.iter().any(contains_inline_payload),
        Value::String(s) => scrub_string(s).is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_named_keys_are_masked_recursively() {
        let raw = json!({
            "prompt": "a fox",
            "api_key": "sk-123",
            "headers": {"Authorization": "Bearer abc", "X-Refresh-Token": "r"},
            "max_tokens": 256
        });
        let clean = sanitize(&raw);
        assert_eq!(clean["prompt"], "a fox");
        assert_eq!(clean["api_key"], MASK);
        assert_eq!(clean["headers"]["Authorization"], MASK);
        assert_eq!(clean["headers"]["X-Refresh-Token"], MASK);
        assert_eq!(clean["max_tokens"], 256);
    }

    #[test]
    fn inline_media_is_replaced_by_size_marker() {
        let blob = "A".repeat(400);
        let raw = json!({
            "image": format!("data:image/png;base64,{blob}"),
            "frames": [blob.clone()],
            "note": "short"
        });
        let clean = sanitize(&raw);
        assert_eq!(clean["image"], "<inline image/png omitted, 300 bytes>");
        assert_eq!(clean["frames"][0], "<base64 omitted, 400 chars>");
        assert_eq!(clean["note"], "short");
        assert!(contains_inline_payload(&raw));
        assert!(!contains_inline_payload(&clean));
    }

    #[test]
    fn long_prose_is_not_mistaken_for_base64() {
        let prose = "a very long prompt with spaces ".repeat(20);
        assert_eq!(sanitize(&json!(prose.clone())), json!(prose));
    }
}
