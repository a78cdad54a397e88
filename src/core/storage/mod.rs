use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::core::error::InvokeError;
use crate::core::normalize::sniff_content_type;

/// Objects larger than this are refused.
const MAX_OBJECT_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
}

/// Durable home for generated and uploaded media.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Download `url` and store the body.
    async fn ingest_remote(&self, url: &str) -> Result<StoredObject, InvokeError>;

    async fn ingest_bytes(
        &self,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<StoredObject, InvokeError>;

    /// True for URLs this storage already serves.
    fn is_durable(&self, url: &str) -> bool;
}

/// Content-addressed filesystem storage served by the API under `/files/{key}`.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
    client: Client,
}

impl LocalObjectStorage {
    pub async fn new(root: impl Into<PathBuf>, public_base_url: &str) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn files_prefix(&self) -> String {
        format!("{}/files/", self.public_base_url)
    }

    /// Filesystem path for a key, `None` for anything that is not a plain
    /// `<hex>.<ext>` name.
    pub fn object_path(&self, key: &str) -> Option<PathBuf> {
        let valid = !key.is_empty()
            && key.len() <= 96
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        valid.then(|| self.root.join(key))
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "text/plain" => "txt",
        "application/json" => "json",
        other => mime_guess::get_mime_extensions_str(other)
            .and_then(|exts| exts.first().copied())
            .unwrap_or("bin"),
    }
}

fn normalize_content_type(raw: Option<&str>) -> Option<String> {
    raw.and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn ingest_remote(&self, url: &str) -> Result<StoredObject, InvokeError> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InvokeError::Storage(format!("fetching {url}: {e}")))?;
        let status = res.status();
        if !status.is_success() {
            return Err(InvokeError::Storage(format!(
                "fetching {url} returned {status}"
            )));
        }
        let header_type = normalize_content_type(
            res.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let data = res
            .bytes()
            .await
            .map_err(|e| InvokeError::Storage(format!("reading {url}: {e}")))?;

        let guessed = url::Url::parse(url).ok().and_then(|u| {
            mime_guess::from_path(u.path())
                .first()
                .map(|m| m.essence_str().to_string())
        });
        let content_type = header_type.or(guessed);
        self.ingest_bytes(data, content_type.as_deref()).await
    }

    async fn ingest_bytes(
        &self,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<StoredObject, InvokeError> {
        if data.is_empty() {
            return Err(InvokeError::Storage("refusing to store an empty object".into()));
        }
        if data.len() > MAX_OBJECT_BYTES {
            return Err(InvokeError::Storage(format!(
                "object of {} bytes exceeds the storage limit",
                data.len()
            )));
        }

        let content_type = normalize_content_type(content_type)
            .or_else(|| sniff_content_type(&data).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let sha256 = hex::encode(Sha256::digest(&data));
        let key = format!("{}.{}", sha256, extension_for(&content_type));
        let path = self.root.join(&key);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            let tmp = self.root.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
            fs::write(&tmp, &data)
                .await
                .map_err(|e| InvokeError::Storage(format!("writing {}: {e}", tmp.display())))?;
            fs::rename(&tmp, &path)
                .await
                .map_err(|e| InvokeError::Storage(format!("storing {key}: {e}")))?;
            debug!(key = %key, size = data.len(), "Stored object");
        }

        Ok(StoredObject {
            url: format!("{}{}", self.files_prefix(), key),
            key,
            content_type,
            size: data.len() as u64,
            sha256,
        })
    }

    fn is_durable(&self, url: &str) -> bool {
        url.starts_with(&self.files_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[tokio::test]
    async fn bytes_are_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path(), "http://media.test/")
            .await
            .unwrap();

        let a = storage
            .ingest_bytes(Bytes::from_static(PNG), None)
            .await
            .unwrap();
        let b = storage
            .ingest_bytes(Bytes::from_static(PNG), Some("image/png; charset=binary"))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert!(a.key.ends_with(".png"));
        assert_eq!(a.content_type, "image/png");
        assert!(a.url.starts_with("http://media.test/files/"));
        assert!(storage.is_durable(&a.url));
        assert!(!storage.is_durable("https://cdn.vendor/x.png"));
        assert!(storage.object_path(&a.key).unwrap().exists());
    }

    #[tokio::test]
    async fn empty_objects_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path(), "http://media.test")
            .await
            .unwrap();
        assert!(matches!(
            storage.ingest_bytes(Bytes::new(), None).await,
            Err(InvokeError::Storage(_))
        ));
    }

    #[test]
    fn object_keys_cannot_escape_the_root() {
        let storage = LocalObjectStorage {
            root: PathBuf::from("/srv/objects"),
            public_base_url: "http://x".into(),
            client: Client::new(),
        };
        assert!(storage.object_path("../etc/passwd").is_none());
        assert!(storage.object_path(".hidden").is_none());
        assert!(storage.object_path("abc/def").is_none());
        assert_eq!(
            storage.object_path("abc123.png"),
            Some(PathBuf::from("/srv/objects/abc123.png"))
        );
        assert_eq!(extension_for("image/jpeg"), "jpg");
    }
}
