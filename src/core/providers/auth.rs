use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::catalog::types::AuthMode;
use crate::core::error::InvokeError;
use crate::core::store::types::CredentialRecord;

/// Tokens are refreshed this long before the vendor says they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
    /// Insertion order, for eviction.
    seq: u64,
}

/// Bounded cache of exchanged access tokens. Keys are derived from the key id
/// and a digest of the secret, so raw secrets are never held here.
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
    capacity: usize,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn cache_key(key_id: &str, secret: &str) -> String {
        format!("{}:{}", key_id, hex::encode(Sha256::digest(secret.as_bytes())))
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let fresh = entries
            .get(key)
            .is_some_and(|t| Instant::now() + REFRESH_MARGIN < t.expires_at);
        if fresh {
            entries.get(key).map(|t| t.token.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub async fn insert(&self, key: String, token: String, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, t| t.expires_at > now);
        if entries.len() >= self.capacity
            && !entries.contains_key(&key)
            && let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, t)| t.seq)
                .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest);
        }
        let seq = entries.values().map(|t| t.seq).max().unwrap_or(0) + 1;
        entries.insert(
            key,
            CachedToken {
                token,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Applies an executor's auth mode to outgoing requests.
pub struct Authenticator {
    client: Client,
    tokens: TokenCache,
}

impl Authenticator {
    pub fn new(client: Client, cache_capacity: usize) -> Self {
        Self {
            client,
            tokens: TokenCache::new(cache_capacity),
        }
    }

    pub async fn apply(
        &self,
        builder: RequestBuilder,
        auth: &AuthMode,
        credential: Option<&CredentialRecord>,
        vendor: &str,
    ) -> Result<RequestBuilder, InvokeError> {
        if matches!(auth, AuthMode::None) {
            return Ok(builder);
        }
        let credential = credential.ok_or_else(|| {
            InvokeError::Config(format!("vendor '{vendor}' requires a credential"))
        })?;

        Ok(match auth {
            AuthMode::None => builder,
            AuthMode::Bearer => builder.bearer_auth(&credential.secret),
            AuthMode::Header { name } => builder.header(name.as_str(), credential.secret.as_str()),
            AuthMode::Query { name } => {
                builder.query(&[(name.as_str(), credential.secret.as_str())])
            }
            AuthMode::TokenExchange {
                token_url,
                ttl_secs,
            } => {
                let token = self
                    .access_token(token_url, *ttl_secs, credential, vendor)
                    .await?;
                builder.bearer_auth(token)
            }
        })
    }

    async fn access_token(
        &self,
        token_url: &str,
        default_ttl_secs: u64,
        credential: &CredentialRecord,
        vendor: &str,
    ) -> Result<String, InvokeError> {
        let key_id = credential.key_id.as_deref().ok_or_else(|| {
            InvokeError::Config(format!(
                "credential {} has no key id for token exchange",
                credential.id
            ))
        })?;
        let cache_key = TokenCache::cache_key(key_id, &credential.secret);
        if let Some(token) = self.tokens.get(&cache_key).await {
            return Ok(token);
        }

        debug!(vendor, credential_id = credential.id, "Exchanging credential for access token");
        let res = self
            .client
            .post(token_url)
            .json(&json!({"access_key": key_id, "secret_key": credential.secret}))
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(InvokeError::from_status(vendor, status, &headers, &body));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| InvokeError::upstream(vendor, format!("token response: {e}")))?;
        let token = ["/access_token", "/token", "/data/access_token", "/data/token"]
            .iter()
            .find_map(|p| parsed.pointer(p).and_then(|v| v.as_str()))
            .ok_or_else(|| InvokeError::upstream(vendor, "token response has no access_token"))?
            .to_string();
        let ttl = ["/expires_in", "/data/expires_in"]
            .iter()
            .find_map(|p| parsed.pointer(p).and_then(|v| v.as_u64()))
            .unwrap_or(default_ttl_secs);

        self.tokens
            .insert(cache_key, token.clone(), Duration::from_secs(ttl))
            .await;
        Ok(token)
    }
}
