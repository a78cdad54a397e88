pub mod auth;
pub mod graph;
pub mod http;
pub mod queue;
pub mod repair;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::core::catalog::types::{Capability, ExecutorRecord};
use crate::core::config::AppConfig;
use crate::core::error::InvokeError;
use crate::core::normalize::CanonicalPayload;
use crate::core::storage::ObjectStorage;
use crate::core::store::types::CredentialRecord;

pub use graph::GraphExecutor;
pub use http::HttpExecutor;
pub use queue::QueueExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Answers synchronously in one HTTP round trip.
    Http,
    /// Node-graph job runner: submit a graph, poll its history.
    NodeGraph,
    /// Vendor job queue: submit, then poll a status endpoint.
    JobQueue,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Http => "http",
            ProviderKind::NodeGraph => "node_graph",
            ProviderKind::JobQueue => "job_queue",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "http" => Some(ProviderKind::Http),
            "node_graph" => Some(ProviderKind::NodeGraph),
            "job_queue" => Some(ProviderKind::JobQueue),
            _ => None,
        }
    }
}

/// Everything needed to find an externally submitted job again, possibly
/// from another process after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub provider: ProviderKind,
    pub job_id: String,
    pub endpoint: String,
    pub capability_id: String,
    #[serde(default)]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub credential_id: Option<i64>,
    /// Audit record closed when the job finishes.
    #[serde(default)]
    pub log_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl PendingJob {
    pub fn new(provider: ProviderKind, job_id: String, req: &AttemptRequest<'_>) -> Self {
        Self {
            provider,
            job_id,
            endpoint: req.executor.endpoint.clone(),
            capability_id: req.capability.id.clone(),
            executor_id: Some(req.executor.id.clone()),
            credential_id: req.credential.map(|c| c.id),
            log_id: req.log_id.map(str::to_string),
            submitted_at: Utc::now(),
        }
    }

    pub fn is_resumable(&self) -> bool {
        !self.job_id.trim().is_empty() && !self.endpoint.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Completed(CanonicalPayload),
    Pending(PendingJob),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(CanonicalPayload),
    Running,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Block until the job finishes or the executor's own deadline passes.
    Wait,
    /// Return the pending descriptor right after the vendor accepts the job.
    SubmitOnly,
}

/// Receives each external submission as soon as the vendor accepts it.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submitted(&self, job: &PendingJob);
}

pub struct AttemptRequest<'a> {
    pub capability: &'a Capability,
    pub executor: &'a ExecutorRecord,
    pub credential: Option<&'a CredentialRecord>,
    pub params: &'a Map<String, Value>,
    /// Input media, already resolved to fetchable URLs.
    pub media: &'a [String],
    pub mode: ExecutionMode,
    pub request_id: &'a str,
    pub log_id: Option<&'a str>,
    pub sink: Option<&'a dyn SubmissionSink>,
}

impl AttemptRequest<'_> {
    pub async fn notify_submitted(&self, job: &PendingJob) {
        if let Some(sink) = self.sink {
            sink.submitted(job).await;
        }
    }
}

pub struct PollRequest<'a> {
    pub job: &'a PendingJob,
    pub capability: &'a Capability,
    pub executor: &'a ExecutorRecord,
    pub credential: Option<&'a CredentialRecord>,
}

#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One attempt against the provider with the given credential.
    async fn execute(&self, req: &AttemptRequest<'_>) -> Result<Attempt, InvokeError>;

    /// One status check of a previously submitted job.
    async fn poll(&self, req: &PollRequest<'_>) -> Result<PollOutcome, InvokeError>;
}

#[derive(Default)]
pub struct ProviderManager {
    executors: Vec<Arc<dyn ProviderExecutor>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(config: &AppConfig, storage: Arc<dyn ObjectStorage>) -> Self {
        let mut manager = Self::new();
        manager.register(Arc::new(HttpExecutor::new(
            storage.clone(),
            &config.http,
        )));
        manager.register(Arc::new(GraphExecutor::new(
            storage.clone(),
            &config.graph,
            &config.http,
        )));
        manager.register(Arc::new(QueueExecutor::new(
            storage,
            &config.queue,
            &config.http,
        )));
        manager
    }

    /// Later registrations replace earlier ones of the same kind.
    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        info!("Registered provider executor: {}", executor.kind().as_str());
        let kind = executor.kind();
        self.executors.retain(|e| e.kind() != kind);
        self.executors.push(executor);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.iter().find(|e| e.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.executors.iter().map(|e| e.kind()).collect()
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base.trim_end_matches('/').to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Copy caller params into a request body, adding the model and media fields
/// the capability declares unless the caller already set them.
pub(crate) fn build_body(
    params: &Map<String, Value>,
    model: Option<&str>,
    media_field: Option<&str>,
    media: &[String],
) -> Map<String, Value> {
    let mut body = params.clone();
    if let Some(model) = model {
        body.entry("model")
            .or_insert_with(|| Value::String(model.to_string()));
    }
    if let Some(field) = media_field
        && !media.is_empty()
        && !body.contains_key(field)
    {
        let value = if media.len() == 1 {
            Value::String(media[0].clone())
        } else {
            Value::Array(media.iter().cloned().map(Value::String).collect())
        };
        body.insert(field.to_string(), value);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(ProviderKind);

    #[async_trait]
    impl ProviderExecutor for Fixed {
        fn kind(&self) -> ProviderKind {
            self.0
        }
        async fn execute(&self, _req: &AttemptRequest<'_>) -> Result<Attempt, InvokeError> {
            Ok(Attempt::Completed(CanonicalPayload::default()))
        }
        async fn poll(&self, _req: &PollRequest<'_>) -> Result<PollOutcome, InvokeError> {
            Ok(PollOutcome::Running)
        }
    }

    #[test]
    fn manager_dispatches_by_kind() {
        let mut manager = ProviderManager::new();
        manager.register(Arc::new(Fixed(ProviderKind::Http)));
        manager.register(Arc::new(Fixed(ProviderKind::JobQueue)));
        manager.register(Arc::new(Fixed(ProviderKind::Http)));

        assert_eq!(manager.kinds().len(), 2);
        assert!(manager.get(ProviderKind::JobQueue).is_some());
        assert!(manager.get(ProviderKind::NodeGraph).is_none());
    }

    #[test]
    fn provider_kind_round_trips_through_text() {
        for kind in [
            ProviderKind::Http,
            ProviderKind::NodeGraph,
            ProviderKind::JobQueue,
        ] {
            assert_eq!(ProviderKind::from_str_opt(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn pending_job_requires_id_and_endpoint() {
        let job: PendingJob = serde_json::from_value(json!({
            "provider": "node_graph",
            "job_id": " ",
            "endpoint": "http://runner",
            "capability_id": "cap",
            "submitted_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(!job.is_resumable());
    }

    #[test]
    fn body_keeps_caller_fields_and_adds_media() {
        let params = json!({"prompt": "a cat", "model": "custom"});
        let body = build_body(
            params.as_object().unwrap(),
            Some("default-model"),
            Some("image_url"),
            &["https://cdn/x.png".to_string()],
        );
        assert_eq!(body["model"], "custom");
        assert_eq!(body["image_url"], "https://cdn/x.png");
        assert_eq!(join_url("http://a/", "/v1/x"), "http://a/v1/x");
    }
}
