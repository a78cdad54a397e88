mod limits;
pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::core::catalog::types::{Capability, CapabilityStatus, ExecutorHealth, ExecutorRecord};
use crate::core::config::AppConfig;
use crate::core::credentials::CredentialSelector;
use crate::core::error::InvokeError;
use crate::core::normalize::{CanonicalPayload, decode_base64, decode_data_uri, is_http_url};
use crate::core::providers::{
    Attempt, AttemptRequest, PendingJob, PollOutcome, PollRequest, ProviderManager,
};
use crate::core::sanitize::sanitize;
use crate::core::storage::ObjectStorage;
use crate::core::store::Store;
use crate::core::store::types::{CostSnapshot, LogFinish, LogStatus, NewInvocationLog};

pub use limits::ExecutorLimits;
pub use types::{
    InvokeOptions, InvokeOutcome, InvokeRequest, InvokeResponse, InvokeStatus, Invocation,
    MediaRef,
};

/// Caller values override defaults; an explicit `null` removes a default.
pub fn merge_params(defaults: &Map<String, Value>, params: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in params {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

pub fn validate_params(
    capability: &Capability,
    params: &Map<String, Value>,
    has_media: bool,
) -> Result<(), InvokeError> {
    if capability.requires_image && !has_media {
        return Err(InvokeError::InvalidRequest(format!(
            "capability '{}' requires an input image",
            capability.id
        )));
    }
    let missing: Vec<&str> = capability
        .required_params()
        .into_iter()
        .filter(|key| {
            let satisfied_by_media = has_media && matches!(*key, "image" | "image_url" | "media");
            let present = match params.get(*key) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            !present && !satisfied_by_media
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(InvokeError::InvalidRequest(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        )))
    }
}

/// Which executor and credential an invocation ended up using.
#[derive(Debug, Default)]
struct AttemptTrace {
    executor_id: Option<String>,
    credential_id: Option<i64>,
}

/// Routes invocations to provider executors and keeps the audit trail.
pub struct Orchestrator {
    store: Store,
    providers: Arc<ProviderManager>,
    selector: CredentialSelector,
    storage: Arc<dyn ObjectStorage>,
    limits: ExecutorLimits,
    transient_retries: u32,
    retry_backoff: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        providers: Arc<ProviderManager>,
        storage: Arc<dyn ObjectStorage>,
        config: &AppConfig,
    ) -> Self {
        Self {
            selector: CredentialSelector::new(
                store.clone(),
                config.credentials.cooldown(),
                config.credentials.max_attempts,
            ),
            store,
            providers,
            storage,
            limits: ExecutorLimits::new(),
            transient_retries: config.http.transient_retries,
            retry_backoff: config.http.retry_backoff(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one invocation. The audit record is opened first and finished
    /// exactly once, except for pending results whose record stays open
    /// until the job is resolved.
    pub async fn invoke(
        &self,
        req: &InvokeRequest,
        options: InvokeOptions,
    ) -> Result<InvokeOutcome, InvokeError> {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let log_id = self
            .store
            .insert_invocation_log(&NewInvocationLog {
                request_id: request_id.clone(),
                capability_id: req.capability_id.clone(),
                task_id: options.task_id.clone(),
                request: sanitize(&json!({"params": req.params, "media": req.media})),
            })
            .await?;

        let mut trace = AttemptTrace::default();
        let result = self
            .run(req, &options, &request_id, &log_id, &mut trace)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let finish = match &result {
            Ok((Attempt::Completed(payload), capability)) => Some(LogFinish {
                status: LogStatus::Succeeded,
                executor_id: trace.executor_id.clone(),
                credential_id: trace.credential_id,
                response: Some(sanitize(&json!(payload))),
                error: None,
                cost: cost_of(capability, payload),
                duration_ms: duration_ms as i64,
            }),
            Ok((Attempt::Pending(_), _)) => None,
            Err(e) => Some(LogFinish {
                status: LogStatus::Failed,
                executor_id: trace.executor_id.clone(),
                credential_id: trace.credential_id,
                response: None,
                error: Some(e.to_string()),
                cost: None,
                duration_ms: duration_ms as i64,
            }),
        };
        if let Some(finish) = finish
            && let Err(e) = self.store.finish_invocation_log(&log_id, &finish).await
        {
            warn!(request_id = %request_id, "Failed to finish invocation log: {}", e);
        }

        match result {
            Ok((attempt, _)) => {
                let result = match attempt {
                    Attempt::Completed(payload) => {
                        info!(
                            request_id = %request_id,
                            capability = %req.capability_id,
                            outputs = payload.output_count(),
                            duration_ms,
                            "Invocation succeeded"
                        );
                        Invocation::Completed(payload)
                    }
                    Attempt::Pending(job) => {
                        info!(
                            request_id = %request_id,
                            capability = %req.capability_id,
                            job_id = %job.job_id,
                            "Invocation pending on external job"
                        );
                        Invocation::Pending(job)
                    }
                };
                Ok(InvokeOutcome {
                    request_id,
                    log_id,
                    duration_ms,
                    result,
                })
            }
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    capability = %req.capability_id,
                    kind = e.kind(),
                    "Invocation failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        req: &InvokeRequest,
        options: &InvokeOptions,
        request_id: &str,
        log_id: &str,
        trace: &mut AttemptTrace,
    ) -> Result<(Attempt, Capability), InvokeError> {
        let capability = self
            .store
            .get_capability(&req.capability_id)
            .await?
            .ok_or_else(|| InvokeError::Config(format!("unknown capability '{}'", req.capability_id)))?;
        if capability.status != CapabilityStatus::Active {
            return Err(InvokeError::Config(format!(
                "capability '{}' is disabled",
                capability.id
            )));
        }

        let params = merge_params(&capability.default_params, &req.params);
        validate_params(&capability, &params, req.media.is_some())?;
        let media = self.resolve_media(req.media.as_ref()).await?;

        let executor = self.resolve_executor(&capability).await?;
        trace.executor_id = Some(executor.id.clone());
        let provider = self.providers.get(executor.provider).ok_or_else(|| {
            InvokeError::Config(format!(
                "no executor registered for provider kind '{}'",
                executor.provider.as_str()
            ))
        })?;

        let _permit = self.limits.acquire(&executor).await?;
        debug!(request_id, executor_id = %executor.id, "Executor slot acquired");

        let (cap, exec, params, media) = (&capability, &executor, &params, &media[..]);
        let sink = options.sink.as_deref();
        let mode = options.mode;
        let mut retries = 0;
        loop {
            let mut used = None;
            let result = self
                .selector
                .run(&cap.vendor, exec, &mut used, |credential| {
                    let provider = provider.clone();
                    async move {
                        let attempt = AttemptRequest {
                            capability: cap,
                            executor: exec,
                            credential: credential.as_ref(),
                            params,
                            media,
                            mode,
                            request_id,
                            log_id: Some(log_id),
                            sink,
                        };
                        provider.execute(&attempt).await
                    }
                })
                .await;
            trace.credential_id = used;

            match result {
                Err(e) if e.is_transient() && retries < self.transient_retries => {
                    retries += 1;
                    let backoff = self.retry_backoff * retries;
                    warn!(
                        request_id,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient provider failure, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other.map(|attempt| (attempt, capability.clone())),
            }
        }
    }

    /// Turn caller media into URLs a provider can fetch. Inline data is
    /// stored first.
    pub async fn resolve_media(&self, media: Option<&MediaRef>) -> Result<Vec<String>, InvokeError> {
        let Some(media) = media else {
            return Ok(Vec::new());
        };
        let refs: Vec<(String, Option<String>)> = match media {
            MediaRef::Url(url) => vec![(url.clone(), None)],
            MediaRef::Urls(urls) => urls.iter().map(|u| (u.clone(), None)).collect(),
            MediaRef::Inline { data, content_type } => vec![(data.clone(), content_type.clone())],
        };

        let mut out = Vec::with_capacity(refs.len());
        for (value, content_type) in refs {
            if is_http_url(&value) {
                out.push(value);
                continue;
            }
            let (sniffed, data) = match decode_data_uri(&value) {
                Some(decoded) => decoded,
                None => (
                    None,
                    decode_base64(&value).ok_or_else(|| {
                        InvokeError::InvalidRequest(
                            "media must be an http(s) URL, a data URI or base64".into(),
                        )
                    })?,
                ),
            };
            let content_type = content_type.or(sniffed);
            let stored = self
                .storage
                .ingest_bytes(Bytes::from(data), content_type.as_deref())
                .await?;
            out.push(stored.url);
        }
        Ok(out)
    }

    /// The pinned executor if the capability names one, otherwise the best
    /// available executor for its provider kind and vendor.
    pub async fn resolve_executor(&self, capability: &Capability) -> Result<ExecutorRecord, InvokeError> {
        let kind = capability.provider.kind();
        let executor = match &capability.executor_id {
            Some(id) => self
                .store
                .get_executor(id)
                .await?
                .ok_or_else(|| InvokeError::Config(format!("unknown executor '{id}'")))?,
            None => self
                .store
                .find_executor(kind, &capability.vendor)
                .await?
                .ok_or_else(|| {
                    InvokeError::Config(format!(
                        "no available {} executor for vendor '{}'",
                        kind.as_str(),
                        capability.vendor
                    ))
                })?,
        };
        if executor.provider != kind {
            return Err(InvokeError::Config(format!(
                "executor '{}' serves {}, capability '{}' needs {}",
                executor.id,
                executor.provider.as_str(),
                capability.id,
                kind.as_str()
            )));
        }
        if executor.health == ExecutorHealth::Down {
            return Err(InvokeError::Config(format!("executor '{}' is down", executor.id)));
        }
        Ok(executor)
    }

    /// One status check of an externally submitted job.
    pub async fn poll_job(&self, job: &PendingJob) -> Result<PollOutcome, InvokeError> {
        let capability = self
            .store
            .get_capability(&job.capability_id)
            .await?
            .ok_or_else(|| InvokeError::Config(format!("unknown capability '{}'", job.capability_id)))?;
        let executor = match &job.executor_id {
            Some(id) => self.store.get_executor(id).await?,
            None => None,
        };
        let executor = match executor {
            Some(executor) => executor,
            None => self.resolve_executor(&capability).await?,
        };
        let credential = match job.credential_id {
            Some(id) if executor.auth.requires_credential() => self.store.get_credential(id).await?,
            _ => None,
        };
        let provider = self.providers.get(job.provider).ok_or_else(|| {
            InvokeError::Config(format!(
                "no executor registered for provider kind '{}'",
                job.provider.as_str()
            ))
        })?;

        provider
            .poll(&PollRequest {
                job,
                capability: &capability,
                executor: &executor,
                credential: credential.as_ref(),
            })
            .await
    }

    /// Close the audit record a pending job left open.
    pub async fn finish_pending_log(&self, job: &PendingJob, outcome: Result<&CanonicalPayload, &str>) {
        let Some(log_id) = &job.log_id else {
            return;
        };
        let cost = match outcome {
            Ok(payload) => match self.store.get_capability(&job.capability_id).await {
                Ok(Some(capability)) => cost_of(&capability, payload),
                _ => None,
            },
            Err(_) => None,
        };
        let duration_ms = (chrono::Utc::now() - job.submitted_at).num_milliseconds().max(0);
        let finish = LogFinish {
            status: if outcome.is_ok() {
                LogStatus::Succeeded
            } else {
                LogStatus::Failed
            },
            executor_id: job.executor_id.clone(),
            credential_id: job.credential_id,
            response: outcome.ok().map(|p| sanitize(&json!(p))),
            error: outcome.err().map(str::to_string),
            cost,
            duration_ms,
        };
        match self.store.finish_invocation_log(log_id, &finish).await {
            Ok(true) => debug!(log_id = %log_id, "Pending invocation log finished"),
            Ok(false) => debug!(log_id = %log_id, "Invocation log was already finished"),
            Err(e) => warn!(log_id = %log_id, "Failed to finish invocation log: {}", e),
        }
    }
}

fn cost_of(capability: &Capability, payload: &CanonicalPayload) -> Option<CostSnapshot> {
    capability
        .pricing
        .as_ref()
        .map(|p| CostSnapshot::new(p.unit_price, payload.output_count().max(1), &p.currency))
}
