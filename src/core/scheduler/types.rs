use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::normalize::CanonicalPayload;
use crate::core::providers::PendingJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Allowed task status moves. `Failed -> Running` is the revive path and is
/// only taken for tasks that still carry a pending job.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskStatus::Queued => matches!(to, TaskStatus::Running | TaskStatus::Failed),
        TaskStatus::Running => matches!(to, TaskStatus::Succeeded | TaskStatus::Failed),
        TaskStatus::Failed => matches!(to, TaskStatus::Running),
        TaskStatus::Succeeded => false,
    }
}

/// What a task has produced so far, stored with an explicit `result_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskResult {
    Completed(CanonicalPayload),
    Pending(PendingJob),
}

impl TaskResult {
    pub fn kind_str(&self) -> &'static str {
        match self {
            TaskResult::Completed(_) => "completed",
            TaskResult::Pending(_) => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub capability_id: String,
    pub owner: Option<String>,
    pub status: TaskStatus,
    /// Request snapshot as submitted.
    pub request: Value,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn pending_job(&self) -> Option<&PendingJob> {
        match &self.result {
            Some(TaskResult::Pending(job)) => Some(job),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&CanonicalPayload> {
        match &self.result {
            Some(TaskResult::Completed(payload)) => Some(payload),
            _ => None,
        }
    }
}

/// Task view returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub capability_id: String,
    pub status: TaskStatus,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub texts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for TaskSnapshot {
    fn from(task: &TaskRecord) -> Self {
        let payload = task.payload().cloned().unwrap_or_default();
        Self {
            task_id: task.id.clone(),
            capability_id: task.capability_id.clone(),
            status: task.status,
            images: payload.images,
            videos: payload.videos,
            texts: payload.texts,
            job_id: task.pending_job().map(|j| j.job_id.clone()),
            error: task.error.clone(),
            attempts: task.attempts,
            created_at: task.created_at,
            updated_at: task.updated_at,
            finished_at: task.finished_at,
        }
    }
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub requeued: usize,
    pub awaiting_poll: usize,
}
