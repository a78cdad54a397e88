use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::auth::Authenticator;
use super::{
    Attempt, AttemptRequest, PollOutcome, PollRequest, ProviderExecutor, ProviderKind, build_body,
    join_url,
};
use crate::core::catalog::types::ProviderSpec;
use crate::core::config::HttpConfig;
use crate::core::error::InvokeError;
use crate::core::normalize::{MediaKind, extract_artifacts, ingest_artifacts};
use crate::core::storage::ObjectStorage;

/// Synchronous providers: one POST, the answer carries the outputs.
pub struct HttpExecutor {
    client: Client,
    auth: Authenticator,
    storage: Arc<dyn ObjectStorage>,
}

impl HttpExecutor {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: &HttpConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            auth: Authenticator::new(client.clone(), config.token_cache_capacity),
            client,
            storage,
        }
    }
}

#[async_trait]
impl ProviderExecutor for HttpExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    async fn execute(&self, req: &AttemptRequest<'_>) -> Result<Attempt, InvokeError> {
        let ProviderSpec::Http(spec) = &req.capability.provider else {
            return Err(InvokeError::Config(format!(
                "capability '{}' is not an http capability",
                req.capability.id
            )));
        };
        let vendor = req.capability.vendor.as_str();
        let url = join_url(&req.executor.endpoint, &spec.path);
        let body = build_body(
            req.params,
            spec.model.as_deref(),
            spec.media_field.as_deref(),
            req.media,
        );

        debug!(request_id = req.request_id, url = %url, "Calling http provider");
        let builder = self.client.post(&url).json(&body);
        let builder = self
            .auth
            .apply(builder, &req.executor.auth, req.credential, vendor)
            .await?;
        let res = builder
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;

        let status = res.status();
        let headers = res.headers().clone();
        let text = res
            .text()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        if !status.is_success() {
            return Err(InvokeError::from_status(vendor, status, &headers, &text));
        }

        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| InvokeError::upstream(vendor, format!("response is not JSON: {e}")))?;
        let artifacts = extract_artifacts(&raw, MediaKind::for_category(req.capability.category));
        let payload = ingest_artifacts(self.storage.as_ref(), artifacts, false).await?;
        if payload.is_empty() {
            return Err(InvokeError::upstream(vendor, "response contained no outputs"));
        }
        Ok(Attempt::Completed(payload))
    }

    async fn poll(&self, req: &PollRequest<'_>) -> Result<PollOutcome, InvokeError> {
        Err(InvokeError::Config(format!(
            "capability '{}' completes synchronously and has no job to poll",
            req.capability.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::types::AuthMode;
    use crate::core::providers::ExecutionMode;
    use crate::core::storage::LocalObjectStorage;
    use crate::core::testing::{self, MockResponse, MockVendor, PNG_B64};
    use serde_json::json;

    async fn executor(dir: &std::path::Path) -> Option<(HttpExecutor, Arc<LocalObjectStorage>)> {
        let storage = Arc::new(LocalObjectStorage::new(dir, "http://media.test").await.ok()?);
        let exec = HttpExecutor::new(storage.clone(), &HttpConfig::default());
        Some((exec, storage))
    }

    #[tokio::test]
    async fn inline_image_becomes_one_durable_url() {
        let Some(vendor) = MockVendor::start().await else {
            return;
        };
        vendor.respond(
            "POST",
            "/v1/images",
            vec![MockResponse::json(200, json!({"data": [{"b64_json": PNG_B64}]}))],
        );
        let dir = tempfile::tempdir().unwrap();
        let (exec, storage) = executor(dir.path()).await.unwrap();
        let capability = testing::http_capability("txt2img", "/v1/images");
        let executor_record = testing::http_executor("acme-http", &vendor.base_url());
        let credential = testing::credential(1, "acme");
        let params = json!({"prompt": "a fox"}).as_object().cloned().unwrap();

        let req = AttemptRequest {
            capability: &capability,
            executor: &executor_record,
            credential: Some(&credential),
            params: &params,
            media: &[],
            mode: ExecutionMode::Wait,
            request_id: "req-1",
            log_id: None,
            sink: None,
        };
        let Attempt::Completed(payload) = exec.execute(&req).await.unwrap() else {
            panic!("expected a completed attempt");
        };
        assert_eq!(payload.images.len(), 1);
        assert!(storage.is_durable(&payload.images[0]));

        let seen = vendor.requests("POST", "/v1/images");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].header("authorization").as_deref(), Some("Bearer secret-1"));
        assert_eq!(seen[0].body["prompt"], "a fox");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let Some(vendor) = MockVendor::start().await else {
            return;
        };
        vendor.respond(
            "POST",
            "/v1/images",
            vec![MockResponse::json(429, json!({"error": "slow down"})).with_header("retry-after", "9")],
        );
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(dir.path()).await.unwrap();
        let capability = testing::http_capability("txt2img", "/v1/images");
        let executor_record = testing::http_executor("acme-http", &vendor.base_url());
        let credential = testing::credential(1, "acme");
        let params = serde_json::Map::new();

        let req = AttemptRequest {
            capability: &capability,
            executor: &executor_record,
            credential: Some(&credential),
            params: &params,
            media: &[],
            mode: ExecutionMode::Wait,
            request_id: "req-2",
            log_id: None,
            sink: None,
        };
        match exec.execute(&req).await {
            Err(InvokeError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(std::time::Duration::from_secs(9)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn run_twice(
        exec: &HttpExecutor,
        vendor: &MockVendor,
        token_path: &str,
        ttl_secs: u64,
        key_id: &str,
    ) {
        let capability = testing::http_capability("txt2img", "/v1/images");
        let mut record = testing::http_executor("acme-http", &vendor.base_url());
        record.auth = AuthMode::TokenExchange {
            token_url: format!("{}{}", vendor.base_url(), token_path),
            ttl_secs,
        };
        let mut credential = testing::credential(1, "acme");
        credential.key_id = Some(key_id.to_string());
        let params = json!({"prompt": "a fox"}).as_object().cloned().unwrap();
        let req = AttemptRequest {
            capability: &capability,
            executor: &record,
            credential: Some(&credential),
            params: &params,
            media: &[],
            mode: ExecutionMode::Wait,
            request_id: "req-1",
            log_id: None,
            sink: None,
        };
        for _ in 0..2 {
            exec.execute(&req).await.unwrap();
        }
    }

    #[tokio::test]
    async fn exchanged_tokens_are_reused_until_near_expiry() {
        let Some(vendor) = MockVendor::start().await else {
            return;
        };
        vendor.respond(
            "POST",
            "/v1/images",
            vec![MockResponse::json(200, json!({"data": [{"url": "https://cdn.acme.test/a.png"}]}))],
        );
        vendor.respond(
            "POST",
            "/v1/token",
            vec![MockResponse::json(200, json!({"data": {"access_token": "tok-long", "expires_in": 3600}}))],
        );
        vendor.respond(
            "POST",
            "/v1/token-brief",
            vec![MockResponse::json(200, json!({"access_token": "tok-brief", "expires_in": 20}))],
        );
        vendor.respond(
            "POST",
            "/v1/token-bare",
            vec![MockResponse::json(200, json!({"access_token": "tok-bare"}))],
        );
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(dir.path()).await.unwrap();

        run_twice(&exec, &vendor, "/v1/token", 1800, "ak-long").await;
        assert_eq!(vendor.count("POST", "/v1/token"), 1);
        let exchange = &vendor.requests("POST", "/v1/token")[0].body;
        assert_eq!(exchange["access_key"], "ak-long");
        let auth: Vec<String> = vendor
            .requests("POST", "/v1/images")
            .iter()
            .filter_map(|r| r.header("authorization"))
            .collect();
        assert_eq!(auth, vec!["Bearer tok-long".to_string(); 2]);

        // expires inside the refresh margin, so every call exchanges again
        run_twice(&exec, &vendor, "/v1/token-brief", 1800, "ak-brief").await;
        assert_eq!(vendor.count("POST", "/v1/token-brief"), 2);

        // no expires_in: the executor's ttl applies, here also inside the margin
        run_twice(&exec, &vendor, "/v1/token-bare", 30, "ak-bare").await;
        assert_eq!(vendor.count("POST", "/v1/token-bare"), 2);
        run_twice(&exec, &vendor, "/v1/token-bare", 1800, "ak-bare-long").await;
        assert_eq!(vendor.count("POST", "/v1/token-bare"), 3);
    }
}
