use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use super::auth::Authenticator;
use super::repair::RepairRegistry;
use super::{
    Attempt, AttemptRequest, ExecutionMode, PendingJob, PollOutcome, PollRequest,
    ProviderExecutor, ProviderKind, build_body, join_url,
};
use crate::core::catalog::types::{Capability, ExecutorRecord, ProviderSpec, QueueSpec};
use crate::core::config::{HttpConfig, QueueConfig};
use crate::core::error::{InvokeError, extract_error_message};
use crate::core::normalize::{MediaKind, extract_artifacts, ingest_artifacts};
use crate::core::storage::ObjectStorage;
use crate::core::store::types::CredentialRecord;

const JOB_ID_PATHS: &[&str] = &[
    "/id",
    "/task_id",
    "/job_id",
    "/data/id",
    "/data/task_id",
    "/data/job_id",
    "/request_id",
];

const STATUS_PATHS: &[&str] = &[
    "/status",
    "/state",
    "/task_status",
    "/data/status",
    "/data/state",
    "/data/task_status",
];

const SUCCESS_STATES: &[&str] = &[
    "succeed", "succeeded", "success", "completed", "complete", "done", "finished",
];
const FAILURE_STATES: &[&str] = &[
    "failed", "failure", "error", "errored", "cancelled", "canceled", "rejected", "expired",
];

const REASON_PATHS: &[&str] = &[
    "/error/message",
    "/error",
    "/reason",
    "/fail_reason",
    "/task_status_msg",
    "/data/task_status_msg",
    "/data/error",
    "/data/fail_reason",
    "/message",
];

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub deadline: Duration,
    pub max_repairs: usize,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_factor: config.backoff_factor.max(1.0),
            deadline: Duration::from_secs(config.deadline_secs),
            max_repairs: config.max_repairs,
        }
    }
}

/// Vendor job queues: submit, then poll a status URL with backoff. Jobs
/// still running at the deadline come back as [`Attempt::Pending`].
pub struct QueueExecutor {
    client: Client,
    auth: Authenticator,
    storage: Arc<dyn ObjectStorage>,
    repairs: RepairRegistry,
    settings: QueueSettings,
}

impl QueueExecutor {
    pub fn new(storage: Arc<dyn ObjectStorage>, queue: &QueueConfig, http: &HttpConfig) -> Self {
        Self::with_settings(storage, QueueSettings::from(queue), http)
    }

    pub fn with_settings(
        storage: Arc<dyn ObjectStorage>,
        settings: QueueSettings,
        http: &HttpConfig,
    ) -> Self {
        let client = Client::builder()
            .timeout(http.timeout())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            auth: Authenticator::new(client.clone(), http.token_cache_capacity),
            client,
            storage,
            repairs: RepairRegistry::with_defaults(),
            settings,
        }
    }

    pub fn with_repairs(mut self, repairs: RepairRegistry) -> Self {
        self.repairs = repairs;
        self
    }

    /// Vendors fetch inputs themselves, so hand them URLs that will not expire.
    async fn durable_media(&self, media: &[String]) -> Result<Vec<String>, InvokeError> {
        let mut out = Vec::with_capacity(media.len());
        for url in media {
            if self.storage.is_durable(url) {
                out.push(url.clone());
            } else {
                out.push(self.storage.ingest_remote(url).await?.url);
            }
        }
        Ok(out)
    }

    async fn submit_once(
        &self,
        req: &AttemptRequest<'_>,
        spec: &QueueSpec,
        body: &Map<String, Value>,
    ) -> Result<String, InvokeError> {
        let vendor = req.capability.vendor.as_str();
        let builder = self
            .client
            .post(join_url(&req.executor.endpoint, &spec.submit_path))
            .json(body);
        let res = self
            .auth
            .apply(builder, &req.executor.auth, req.credential, vendor)
            .await?
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

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| InvokeError::upstream(vendor, format!("submit response is not JSON: {e}")))?;
        if let QueueJobState::Failed(reason) = job_state(&parsed) {
            return Err(InvokeError::upstream(vendor, reason));
        }
        extract_job_id(&parsed)
            .ok_or_else(|| InvokeError::upstream(vendor, "submit response carries no job id"))
    }

    /// Submit, repairing rejected parameters at most `max_repairs` times.
    async fn submit(&self, req: &AttemptRequest<'_>, spec: &QueueSpec) -> Result<String, InvokeError> {
        let vendor = req.capability.vendor.as_str();
        let media = self.durable_media(req.media).await?;
        let mut params = req.params.clone();
        let mut repairs = 0;

        loop {
            let body = build_body(
                &params,
                spec.model.as_deref(),
                spec.media_field.as_deref(),
                &media,
            );
            let err = match self.submit_once(req, spec, &body).await {
                Ok(job_id) => return Ok(job_id),
                Err(err) => err,
            };

            let repaired = match &err {
                InvokeError::Validation { message, .. } if repairs < self.settings.max_repairs => {
                    self.repairs.try_repair(vendor, message, &mut params)
                }
                _ => None,
            };
            match repaired {
                Some(change) => {
                    repairs += 1;
                    warn!(
                        request_id = req.request_id,
                        vendor,
                        repair = repairs,
                        "Submission rejected, retrying with {}",
                        change
                    );
                }
                None => return Err(err),
            }
        }
    }

    async fn check(
        &self,
        job: &PendingJob,
        capability: &Capability,
        spec: &QueueSpec,
        executor: &ExecutorRecord,
        credential: Option<&CredentialRecord>,
    ) -> Result<PollOutcome, InvokeError> {
        let vendor = capability.vendor.as_str();
        let path = spec.status_path.replace("{id}", &job.job_id);
        let builder = self.client.get(join_url(&job.endpoint, &path));
        let res = self
            .auth
            .apply(builder, &executor.auth, credential, vendor)
            .await?
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(PollOutcome::Running);
        }
        let headers = res.headers().clone();
        let text = res
            .text()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        if !status.is_success() {
            return Err(InvokeError::from_status(vendor, status, &headers, &text));
        }

        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| InvokeError::upstream(vendor, format!("status response is not JSON: {e}")))?;
        match job_state(&raw) {
            QueueJobState::Running => Ok(PollOutcome::Running),
            QueueJobState::Failed(reason) => Ok(PollOutcome::Failed(reason)),
            QueueJobState::Succeeded => {
                let artifacts = extract_artifacts(&raw, MediaKind::for_category(capability.category));
                let payload = ingest_artifacts(self.storage.as_ref(), artifacts, true).await?;
                if payload.is_empty() {
                    Ok(PollOutcome::Running)
                } else {
                    Ok(PollOutcome::Completed(payload))
                }
            }
        }
    }
}

fn queue_spec(capability: &Capability) -> Result<&QueueSpec, InvokeError> {
    match &capability.provider {
        ProviderSpec::JobQueue(spec) => Ok(spec),
        _ => Err(InvokeError::Config(format!(
            "capability '{}' is not a job-queue capability",
            capability.id
        ))),
    }
}

#[async_trait]
impl ProviderExecutor for QueueExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::JobQueue
    }

    async fn execute(&self, req: &AttemptRequest<'_>) -> Result<Attempt, InvokeError> {
        let spec = queue_spec(req.capability)?;
        let vendor = req.capability.vendor.as_str();

        let job_id = self.submit(req, spec).await?;
        let job = PendingJob::new(ProviderKind::JobQueue, job_id, req);
        info!(request_id = req.request_id, vendor, job_id = %job.job_id, "Queue job submitted");
        req.notify_submitted(&job).await;
        if req.mode == ExecutionMode::SubmitOnly {
            return Ok(Attempt::Pending(job));
        }

        let deadline = Instant::now()
            + spec
                .deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(self.settings.deadline);
        let mut backoff = self.settings.initial_backoff;
        loop {
            if Instant::now() + backoff > deadline {
                info!(job_id = %job.job_id, "Queue job still running at deadline, leaving it pending");
                return Ok(Attempt::Pending(job));
            }
            sleep(backoff).await;
            backoff = backoff
                .mul_f64(self.settings.backoff_factor)
                .min(self.settings.max_backoff);

            match self
                .check(&job, req.capability, spec, req.executor, req.credential)
                .await
            {
                Ok(PollOutcome::Completed(payload)) => return Ok(Attempt::Completed(payload)),
                Ok(PollOutcome::Failed(reason)) => return Err(InvokeError::upstream(vendor, reason)),
                Ok(PollOutcome::Running) => {}
                Err(e) if e.is_transient() => {
                    warn!(job_id = %job.job_id, "Transient error while polling queue job: {}", e);
                }
                // Accepted jobs are never resubmitted; a throttled status check only slows polling.
                Err(InvokeError::RateLimited { retry_after, .. }) => {
                    warn!(job_id = %job.job_id, ?retry_after, "Status check rate limited, backing off");
                    if let Some(wait) = retry_after {
                        backoff = backoff.max(wait);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll(&self, req: &PollRequest<'_>) -> Result<PollOutcome, InvokeError> {
        let spec = queue_spec(req.capability)?;
        self.check(req.job, req.capability, spec, req.executor, req.credential)
            .await
    }
}

#[derive(Debug, Clone, PartialEq)]
enum QueueJobState {
    Running,
    Succeeded,
    Failed(String),
}

fn extract_job_id(raw: &Value) -> Option<String> {
    JOB_ID_PATHS.iter().find_map(|p| match raw.pointer(p) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn job_state(raw: &Value) -> QueueJobState {
    let Some(state) = STATUS_PATHS
        .iter()
        .find_map(|p| raw.pointer(p).and_then(|v| v.as_str()))
        .map(str::to_ascii_lowercase)
    else {
        return QueueJobState::Running;
    };
    if SUCCESS_STATES.contains(&state.as_str()) {
        QueueJobState::Succeeded
    } else if FAILURE_STATES.contains(&state.as_str()) {
        let reason = REASON_PATHS
            .iter()
            .find_map(|p| raw.pointer(p).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| extract_error_message(&raw.to_string()));
        QueueJobState::Failed(format!("job {state}: {reason}"))
    } else {
        QueueJobState::Running
    }
}
