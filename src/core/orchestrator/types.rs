use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::normalize::CanonicalPayload;
use crate::core::providers::{ExecutionMode, PendingJob, SubmissionSink};

/// Caller-supplied input media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaRef {
    Url(String),
    Urls(Vec<String>),
    Inline {
        /// Base64 or a `data:` URI.
        data: String,
        #[serde(default, rename = "contentType", alias = "content_type")]
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    #[serde(alias = "capability_id")]
    pub capability_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, alias = "callback_url", skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeStatus {
    Succeeded,
    Pending,
}

/// Body returned by `Invoke`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub status: InvokeStatus,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub texts: Vec<String>,
    pub request_id: String,
    pub log_id: String,
    pub duration_ms: u64,
    /// Set when the work continues as a task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed(CanonicalPayload),
    Pending(PendingJob),
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub request_id: String,
    pub log_id: String,
    pub duration_ms: u64,
    pub result: Invocation,
}

impl InvokeOutcome {
    pub fn into_response(self, task_id: Option<String>) -> InvokeResponse {
        let (status, payload, job_id) = match self.result {
            Invocation::Completed(payload) => (InvokeStatus::Succeeded, payload, None),
            Invocation::Pending(job) => (
                InvokeStatus::Pending,
                CanonicalPayload::default(),
                Some(job.job_id),
            ),
        };
        InvokeResponse {
            status,
            images: payload.images,
            videos: payload.videos,
            texts: payload.texts,
            request_id: self.request_id,
            log_id: self.log_id,
            duration_ms: self.duration_ms,
            task_id,
            job_id,
        }
    }
}

#[derive(Clone)]
pub struct InvokeOptions {
    pub mode: ExecutionMode,
    pub task_id: Option<String>,
    pub sink: Option<Arc<dyn SubmissionSink>>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Wait,
            task_id: None,
            sink: None,
        }
    }
}
