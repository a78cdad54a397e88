use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::catalog::types::Category;
use crate::core::error::InvokeError;
use crate::core::storage::ObjectStorage;

/// Provider-independent result: stable URLs and plain texts only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPayload {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub videos: Vec<String>,
    #[serde(default)]
    pub texts: Vec<String>,
}

impl CanonicalPayload {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty() && self.texts.is_empty()
    }

    pub fn output_count(&self) -> usize {
        self.images.len() + self.videos.len() + self.texts.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Video => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Url {
        url: String,
        kind: MediaKind,
    },
    Inline {
        data: Bytes,
        content_type: Option<String>,
        kind: MediaKind,
    },
    Text(String),
}

/// Keys under which providers put output media.
const MEDIA_KEYS: &[&str] = &[
    "url",
    "urls",
    "uri",
    "image",
    "images",
    "image_url",
    "image_urls",
    "video",
    "videos",
    "video_url",
    "video_urls",
    "output",
    "outputs",
    "result",
    "results",
    "data",
    "works",
    "resource",
    "task_result",
    "generations",
];

const INLINE_KEYS: &[&str] = &["b64_json", "base64", "image_base64", "b64"];
const TEXT_KEYS: &[&str] = &["text", "texts", "output_text"];

/// Walk a provider response and collect every output artifact in order.
/// URL duplicates are dropped.
pub fn extract_artifacts(raw: &Value, default_kind: MediaKind) -> Vec<Artifact> {
    let mut out = Vec::new();

    // chat-completion style text
    if let Some(choices) = raw.get("choices").and_then(|v| v.as_array()) {
        for choice in choices {
            if let Some(text) = choice
                .pointer("/message/content")
                .and_then(|v| v.as_str())
                .or_else(|| choice.get("text").and_then(|v| v.as_str()))
            {
                out.push(Artifact::Text(text.to_string()));
            }
        }
    }

    walk(raw, None, default_kind, &mut out);

    let mut seen = std::collections::HashSet::new();
    out.retain(|artifact| match artifact {
        Artifact::Url { url, .. } => seen.insert(url.clone()),
        _ => true,
    });
    out
}

fn walk(value: &Value, key: Option<&str>, default_kind: MediaKind, out: &mut Vec<Artifact>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let k = k.as_str();
                if k == "choices" {
                    continue;
                }
                if INLINE_KEYS.contains(&k) {
                    if let Some(s) = v.as_str()
                        && let Some(data) = decode_base64(s)
                    {
                        let content_type = sniff_content_type(&data).map(str::to_string);
                        out.push(Artifact::Inline {
                            kind: kind_for(Some(k), content_type.as_deref(), default_kind),
                            data: Bytes::from(data),
                            content_type,
                        });
                    }
                    continue;
                }
                if TEXT_KEYS.contains(&k) {
                    collect_texts(v, out);
                    continue;
                }
                if MEDIA_KEYS.contains(&k) {
                    // `{"videos": [{"url": ..}]}` keeps the more specific parent key
                    let hint = match (k, key) {
                        ("url" | "urls" | "uri", Some(parent)) => parent,
                        _ => k,
                    };
                    walk(v, Some(hint), default_kind, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, key, default_kind, out);
            }
        }
        Value::String(s) => {
            let Some(key) = key else { return };
            if let Some((content_type, data)) = decode_data_uri(s) {
                out.push(Artifact::Inline {
                    kind: kind_for(Some(key), content_type.as_deref(), default_kind),
                    data: Bytes::from(data),
                    content_type,
                });
            } else if is_http_url(s) {
                out.push(Artifact::Url {
                    kind: kind_for(Some(key), url_content_type(s).as_deref(), default_kind),
                    url: s.clone(),
                });
            }
        }
        _ => {}
    }
}

fn collect_texts(value: &Value, out: &mut Vec<Artifact>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(Artifact::Text(s.clone())),
        Value::Array(items) => items.iter().for_each(|v| collect_texts(v, out)),
        _ => {}
    }
}

fn kind_for(key: Option<&str>, content_type: Option<&str>, default_kind: MediaKind) -> MediaKind {
    if let Some(ct) = content_type {
        if ct.starts_with("video/") || (ct == "image/gif" && default_kind == MediaKind::Video) {
            return MediaKind::Video;
        }
        if ct.starts_with("image/") {
            return MediaKind::Image;
        }
    }
    match key {
        Some(k) if k.contains("video") => MediaKind::Video,
        Some(k) if k.contains("image") => MediaKind::Image,
        _ => default_kind,
    }
}

fn url_content_type(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok()?.path().to_string();
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
}

pub fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// `data:<mime>;base64,<payload>` → (mime, bytes).
pub fn decode_data_uri(s: &str) -> Option<(Option<String>, Vec<u8>)> {
    let rest = s.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let data = decode_base64(payload)?;
    let mime = if mime.is_empty() {
        sniff_content_type(&data).map(str::to_string)
    } else {
        Some(mime.to_string())
    };
    Some((mime, data))
}

pub fn decode_base64(s: &str) -> Option<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    base64::engine::general_purpose::STANDARD
        .decode(&cleaned)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned))
        .ok()
}

/// Magic-number detection for the media types providers actually return.
pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF8") {
        Some("image/gif")
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.len() >= 12 && &data[4..8] == b"ftyp" {
        Some("video/mp4")
    } else if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("video/webm")
    } else {
        None
    }
}

/// Turn artifacts into a canonical payload. Inline binaries always go to
/// object storage; remote URLs are re-hosted when `rehost_remote` is set
/// (vendor URLs that expire) and kept as-is otherwise.
pub async fn ingest_artifacts(
    storage: &dyn ObjectStorage,
    artifacts: Vec<Artifact>,
    rehost_remote: bool,
) -> Result<CanonicalPayload, InvokeError> {
    let mut payload = CanonicalPayload::default();
    for artifact in artifacts {
        let (url, kind) = match artifact {
            Artifact::Text(text) => {
                payload.texts.push(text);
                continue;
            }
            Artifact::Inline {
                data,
                content_type,
                kind,
            } => {
                let stored = storage.ingest_bytes(data, content_type.as_deref()).await?;
                (stored.url, kind)
            }
            Artifact::Url { url, kind } => {
                if rehost_remote && !storage.is_durable(&url) {
                    (storage.ingest_remote(&url).await?.url, kind)
                } else {
                    (url, kind)
                }
            }
        };
        match kind {
            MediaKind::Image => payload.images.push(url),
            MediaKind::Video => payload.videos.push(url),
        }
    }
    Ok(payload)
}
