use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::{TaskRecord, TaskStatus};
use crate::core::error::InvokeError;
use crate::core::normalize::CanonicalPayload;
use crate::core::orchestrator::Orchestrator;
use crate::core::providers::PollOutcome;
use crate::core::store::Store;

/// Effect a single check had on a task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollVerdict {
    Unchanged,
    /// Another caller finalized the task first; the passed record is stale.
    Superseded,
    Revived,
    Succeeded(CanonicalPayload),
    Failed(String),
}

/// On-demand completion checks for tasks parked on an external job.
#[derive(Clone)]
pub struct CompletionPoller {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    timeout: Duration,
}

impl CompletionPoller {
    pub fn new(store: Store, orchestrator: Arc<Orchestrator>, timeout: Duration) -> Self {
        Self {
            store,
            orchestrator,
            timeout,
        }
    }

    async fn check(&self, task: &TaskRecord) -> Option<PollOutcome> {
        let job = task.pending_job()?;
        match tokio::time::timeout(self.timeout, self.orchestrator.poll_job(job)).await {
            Err(_) => {
                debug!(task_id = %task.id, job_id = %job.job_id, "Completion check timed out");
                None
            }
            Ok(Err(e)) => {
                if e.is_transient() || matches!(e, InvokeError::Timeout(_)) {
                    debug!(task_id = %task.id, "Transient completion check failure: {}", e);
                } else {
                    warn!(task_id = %task.id, job_id = %job.job_id, "Completion check failed: {}", e);
                }
                None
            }
            Ok(Ok(outcome)) => Some(outcome),
        }
    }

    /// One check of a running task's job; finalizes the task when the job
    /// has finished.
    pub async fn refresh(&self, task: &TaskRecord) -> anyhow::Result<PollVerdict> {
        if task.status != TaskStatus::Running {
            return Ok(PollVerdict::Unchanged);
        }
        let Some(job) = task.pending_job() else {
            return Ok(PollVerdict::Unchanged);
        };

        match self.check(task).await {
            Some(PollOutcome::Completed(payload)) => {
                if self.store.complete_task(&task.id, &payload).await? {
                    info!(task_id = %task.id, job_id = %job.job_id, "Task completed");
                    self.orchestrator.finish_pending_log(job, Ok(&payload)).await;
                    Ok(PollVerdict::Succeeded(payload))
                } else {
                    debug!(task_id = %task.id, "Task already finalized elsewhere");
                    Ok(PollVerdict::Superseded)
                }
            }
            Some(PollOutcome::Failed(reason)) => {
                if self.store.fail_task(&task.id, &reason).await? {
                    warn!(task_id = %task.id, job_id = %job.job_id, "Task failed: {}", reason);
                    self.orchestrator.finish_pending_log(job, Err(&reason)).await;
                    Ok(PollVerdict::Failed(reason))
                } else {
                    debug!(task_id = %task.id, "Task already finalized elsewhere");
                    Ok(PollVerdict::Superseded)
                }
            }
            Some(PollOutcome::Running) | None => Ok(PollVerdict::Unchanged),
        }
    }

    /// Bring a failed task back when its job turns out to be alive or done.
    pub async fn revive(&self, task: &TaskRecord) -> anyhow::Result<PollVerdict> {
        if task.status != TaskStatus::Failed {
            return Ok(PollVerdict::Unchanged);
        }
        let Some(job) = task.pending_job() else {
            return Ok(PollVerdict::Unchanged);
        };

        match self.check(task).await {
            Some(PollOutcome::Running) => {
                if self.store.revive_task(&task.id).await? {
                    info!(task_id = %task.id, job_id = %job.job_id, "Task revived, job still running");
                    return Ok(PollVerdict::Revived);
                }
                Ok(PollVerdict::Superseded)
            }
            Some(PollOutcome::Completed(payload)) => {
                if self.store.revive_task(&task.id).await?
                    && self.store.complete_task(&task.id, &payload).await?
                {
                    info!(task_id = %task.id, job_id = %job.job_id, "Task revived as completed");
                    self.orchestrator.finish_pending_log(job, Ok(&payload)).await;
                    return Ok(PollVerdict::Succeeded(payload));
                }
                Ok(PollVerdict::Superseded)
            }
            Some(PollOutcome::Failed(_)) | None => Ok(PollVerdict::Unchanged),
        }
    }
}
