use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::{
    Attempt, AttemptRequest, ExecutionMode, PendingJob, PollOutcome, PollRequest,
    ProviderExecutor, ProviderKind, join_url,
};
use crate::core::catalog::types::{AuthMode, ExecutorRecord, GraphSpec, ProviderSpec};
use crate::core::config::{GraphConfig, HttpConfig};
use crate::core::error::InvokeError;
use crate::core::normalize::{Artifact, MediaKind, ingest_artifacts};
use crate::core::storage::ObjectStorage;
use crate::core::store::types::CredentialRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphJobState {
    Submitted,
    Polling,
    Completed,
    Errored,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub per_extra_output: Duration,
}

impl From<&GraphConfig> for GraphSettings {
    fn from(config: &GraphConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            per_extra_output: Duration::from_secs(config.per_extra_output_secs),
        }
    }
}

/// Node-graph job runner: upload inputs, patch the graph, POST `/prompt`,
/// then follow `/history/{prompt_id}` until outputs appear.
pub struct GraphExecutor {
    client: Client,
    auth: Authenticator,
    storage: Arc<dyn ObjectStorage>,
    settings: GraphSettings,
}

impl GraphExecutor {
    pub fn new(storage: Arc<dyn ObjectStorage>, graph: &GraphConfig, http: &HttpConfig) -> Self {
        Self::with_settings(storage, GraphSettings::from(graph), http)
    }

    pub fn with_settings(
        storage: Arc<dyn ObjectStorage>,
        settings: GraphSettings,
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
            settings,
        }
    }

    fn timeout_for(&self, spec: &GraphSpec, params: &Map<String, Value>) -> Duration {
        let base = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.timeout);
        let extra = batch_size(spec, params).saturating_sub(1);
        base + self.settings.per_extra_output * extra
    }

    async fn authed(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &AuthMode,
        credential: Option<&CredentialRecord>,
        vendor: &str,
    ) -> Result<reqwest::RequestBuilder, InvokeError> {
        self.auth.apply(builder, auth, credential, vendor).await
    }

    /// Copy an input image into the runner's input folder. Returns the name
    /// the graph should reference.
    async fn upload_media(&self, req: &AttemptRequest<'_>, url: &str) -> Result<String, InvokeError> {
        let vendor = req.capability.vendor.as_str();
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        if !res.status().is_success() {
            return Err(InvokeError::InvalidRequest(format!(
                "input media {url} returned {}",
                res.status()
            )));
        }
        let data = res
            .bytes()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;

        let filename = url::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty() && name.contains('.'))
            .unwrap_or_else(|| format!("capflow-{}.png", uuid::Uuid::new_v4().simple()));

        let form = Form::new()
            .part("image", Part::bytes(data.to_vec()).file_name(filename))
            .text("overwrite", "true");
        let builder = self
            .client
            .post(join_url(&req.executor.endpoint, "/upload/image"))
            .multipart(form);
        let res = self
            .authed(builder, &req.executor.auth, req.credential, vendor)
            .await?
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        let status = res.status();
        let headers = res.headers().clone();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(InvokeError::from_status(vendor, status, &headers, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| InvokeError::upstream(vendor, format!("upload response: {e}")))?;
        let name = parsed
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| InvokeError::upstream(vendor, "upload response has no name"))?;
        Ok(match parsed.get("subfolder").and_then(|v| v.as_str()) {
            Some(sub) if !sub.is_empty() => format!("{sub}/{name}"),
            _ => name.to_string(),
        })
    }

    async fn submit(&self, req: &AttemptRequest<'_>, spec: &GraphSpec) -> Result<PendingJob, InvokeError> {
        let vendor = req.capability.vendor.as_str();
        let mut params = req.params.clone();

        for (i, url) in req.media.iter().enumerate() {
            let name = self.upload_media(req, url).await?;
            let key = if i == 0 {
                "image".to_string()
            } else {
                format!("image_{}", i + 1)
            };
            params.insert(key, Value::String(name));
        }

        if spec.node_map.contains_key("seed") && params.get("seed").is_none_or(Value::is_null) {
            let seed: u64 = rand::thread_rng().gen_range(0..(1u64 << 48));
            params.insert("seed".into(), json!(seed));
        }

        let graph = patch_workflow(&spec.workflow, spec, &params)?;
        let body = json!({
            "prompt": graph,
            "client_id": uuid::Uuid::new_v4().to_string(),
        });

        let builder = self
            .client
            .post(join_url(&req.executor.endpoint, "/prompt"))
            .json(&body);
        let res = self
            .authed(builder, &req.executor.auth, req.credential, vendor)
            .await?
            .send()
            .await
            .map_err(|e| InvokeError::from_reqwest(vendor, e))?;
        let status = res.status();
        let headers = res.headers().clone();
        let text = res.text().await.unwrap_or_default();

        let parsed: Option<Value> = serde_json::from_str(&text).ok();
        if let Some(errors) = parsed.as_ref().and_then(node_errors) {
            return Err(InvokeError::Validation {
                vendor: vendor.to_string(),
                message: format!("graph rejected: {errors}"),
            });
        }
        if !status.is_success() {
            return Err(InvokeError::from_status(vendor, status, &headers, &text));
        }

        let prompt_id = parsed
            .as_ref()
            .and_then(|v| v.get("prompt_id"))
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| InvokeError::upstream(vendor, "runner returned no prompt_id"))?;

        let job = PendingJob::new(ProviderKind::NodeGraph, prompt_id.to_string(), req);
        info!(
            request_id = req.request_id,
            prompt_id = %job.job_id,
            "Graph job submitted"
        );
        req.notify_submitted(&job).await;
        Ok(job)
    }

    /// One look at `/history/{id}`.
    async fn check(
        &self,
        job: &PendingJob,
        executor: &ExecutorRecord,
        credential: Option<&CredentialRecord>,
        vendor: &str,
    ) -> Result<PollOutcome, InvokeError> {
        let url = join_url(&job.endpoint, &format!("/history/{}", job.job_id));
        let builder = self.client.get(&url);
        let res = self
            .authed(builder, &executor.auth, credential, vendor)
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

        let history: Value = serde_json::from_str(&text)
            .map_err(|e| InvokeError::upstream(vendor, format!("history is not JSON: {e}")))?;
        let Some(entry) = history.get(&job.job_id) else {
            return Ok(PollOutcome::Running);
        };

        let status_obj = entry.get("status");
        if status_obj
            .and_then(|s| s.get("status_str"))
            .and_then(|v| v.as_str())
            == Some("error")
        {
            return Ok(PollOutcome::Failed(execution_error(entry)));
        }

        let artifacts = output_artifacts(&job.endpoint, entry);
        if artifacts.is_empty() {
            return Ok(PollOutcome::Running);
        }
        let payload = ingest_artifacts(self.storage.as_ref(), artifacts, true).await?;
        Ok(PollOutcome::Completed(payload))
    }
}

#[async_trait]
impl ProviderExecutor for GraphExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::NodeGraph
    }

    async fn execute(&self, req: &AttemptRequest<'_>) -> Result<Attempt, InvokeError> {
        let ProviderSpec::NodeGraph(spec) = &req.capability.provider else {
            return Err(InvokeError::Config(format!(
                "capability '{}' is not a node-graph capability",
                req.capability.id
            )));
        };
        let vendor = req.capability.vendor.as_str();

        let mut state = GraphJobState::Submitted;
        let job = self.submit(req, spec).await?;
        if req.mode == ExecutionMode::SubmitOnly {
            return Ok(Attempt::Pending(job));
        }

        let timeout = self.timeout_for(spec, req.params);
        let deadline = Instant::now() + timeout;
        loop {
            if state == GraphJobState::Submitted {
                state = GraphJobState::Polling;
            }
            match self.check(&job, req.executor, req.credential, vendor).await {
                Ok(PollOutcome::Completed(payload)) => {
                    state = GraphJobState::Completed;
                    debug!(prompt_id = %job.job_id, ?state, "Graph job finished");
                    return Ok(Attempt::Completed(payload));
                }
                Ok(PollOutcome::Failed(reason)) => {
                    state = GraphJobState::Errored;
                    debug!(prompt_id = %job.job_id, ?state, "Graph job errored");
                    return Err(InvokeError::upstream(vendor, reason));
                }
                Ok(PollOutcome::Running) => {}
                Err(e) if e.is_transient() => {
                    warn!(prompt_id = %job.job_id, "Transient error while polling graph job: {}", e);
                }
                // Accepted prompts are never resubmitted; a throttled history check only slows polling.
                Err(InvokeError::RateLimited { retry_after, .. }) => {
                    warn!(prompt_id = %job.job_id, ?retry_after, "History check rate limited, backing off");
                    if let Some(wait) = retry_after {
                        sleep(wait.min(deadline.saturating_duration_since(Instant::now()))).await;
                    }
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                state = GraphJobState::TimedOut;
                warn!(prompt_id = %job.job_id, ?state, "Graph job exceeded its timeout");
                return Err(InvokeError::Timeout(format!(
                    "graph job {} did not finish within {}s",
                    job.job_id,
                    timeout.as_secs()
                )));
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn poll(&self, req: &PollRequest<'_>) -> Result<PollOutcome, InvokeError> {
        self.check(
            req.job,
            req.executor,
            req.credential,
            req.capability.vendor.as_str(),
        )
        .await
    }
}

fn batch_size(spec: &GraphSpec, params: &Map<String, Value>) -> u32 {
    spec.batch_param
        .as_ref()
        .and_then(|key| params.get(key))
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|n| n.clamp(1, 64) as u32)
        .unwrap_or(1)
}

/// Write caller parameters into graph node inputs through `node_map`.
pub(crate) fn patch_workflow(
    workflow: &Value,
    spec: &GraphSpec,
    params: &Map<String, Value>,
) -> Result<Value, InvokeError> {
    let mut graph = workflow.clone();
    let nodes = graph
        .as_object_mut()
        .ok_or_else(|| InvokeError::Config("workflow must be a JSON object of nodes".into()))?;

    for (param, target) in &spec.node_map {
        let Some(value) = params.get(param) else {
            continue;
        };
        let (node_id, input) = target.split_once('.').ok_or_else(|| {
            InvokeError::Config(format!("node_map target '{target}' must be 'node.input'"))
        })?;
        let node = nodes
            .get_mut(node_id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| InvokeError::Config(format!("workflow has no node '{node_id}'")))?;
        let inputs = node
            .entry("inputs")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| InvokeError::Config(format!("node '{node_id}' inputs is not an object")))?;
        inputs.insert(input.to_string(), value.clone());
    }
    Ok(graph)
}

fn node_errors(response: &Value) -> Option<String> {
    match response.get("node_errors") {
        Some(Value::Object(errors)) if !errors.is_empty() => Some(Value::Object(errors.clone()).to_string()),
        _ => match response.get("error") {
            Some(Value::Object(err)) => Some(
                err.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("invalid prompt")
                    .to_string(),
            ),
            _ => None,
        },
    }
}

fn execution_error(entry: &Value) -> String {
    entry
        .pointer("/status/messages")
        .and_then(|m| m.as_array())
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                let pair = m.as_array()?;
                if pair.first()?.as_str()? != "execution_error" {
                    return None;
                }
                let detail = pair.get(1)?;
                let node = detail.get("node_type").and_then(|v| v.as_str()).unwrap_or("node");
                let message = detail
                    .get("exception_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("execution error");
                Some(format!("{node}: {}", message.trim()))
            })
        })
        .unwrap_or_else(|| "graph execution failed".to_string())
}

/// `/view` URLs for every saved output in a history entry.
fn output_artifacts(endpoint: &str, entry: &Value) -> Vec<Artifact> {
    let Some(outputs) = entry.get("outputs").and_then(|o| o.as_object()) else {
        return Vec::new();
    };
    let mut artifacts = Vec::new();
    for node_output in outputs.values() {
        for (field, kind) in [
            ("images", MediaKind::Image),
            ("gifs", MediaKind::Video),
            ("videos", MediaKind::Video),
        ] {
            let Some(files) = node_output.get(field).and_then(|v| v.as_array()) else {
                continue;
            };
            for file in files {
                let Some(filename) = file.get("filename").and_then(|v| v.as_str()) else {
                    continue;
                };
                let subfolder = file.get("subfolder").and_then(|v| v.as_str()).unwrap_or("");
                let kind_str = file.get("type").and_then(|v| v.as_str()).unwrap_or("output");
                if kind_str == "temp" {
                    continue;
                }
                let Ok(mut url) = url::Url::parse(&join_url(endpoint, "/view")) else {
                    continue;
                };
                url.query_pairs_mut()
                    .append_pair("filename", filename)
                    .append_pair("subfolder", subfolder)
                    .append_pair("type", kind_str);
                let kind = if filename.ends_with(".mp4") || filename.ends_with(".webm") {
                    MediaKind::Video
                } else {
                    kind
                };
                artifacts.push(Artifact::Url {
                    url: url.to_string(),
                    kind,
                });
            }
        }
    }
    artifacts
}
