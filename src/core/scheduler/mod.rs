pub mod poller;
pub mod types;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::callback::{CallbackNotifier, CallbackPayload};
use crate::core::config::AppConfig;
use crate::core::error::InvokeError;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::{
    InvokeOptions, InvokeRequest, InvokeResponse, Invocation, Orchestrator,
};
use crate::core::providers::{ExecutionMode, PendingJob, ProviderKind, SubmissionSink};
use crate::core::store::Store;
use poller::{CompletionPoller, PollVerdict};
use types::{ResumeReport, TaskHandle, TaskRecord, TaskSnapshot, TaskStatus};

/// Persists each external submission on its task the moment the vendor
/// accepts it.
struct TaskSubmissionSink {
    store: Store,
    task_id: String,
}

#[async_trait]
impl SubmissionSink for TaskSubmissionSink {
    async fn submitted(&self, job: &PendingJob) {
        match self.store.attach_pending(&self.task_id, job).await {
            Ok(true) => debug!(task_id = %self.task_id, job_id = %job.job_id, "Pending job recorded"),
            Ok(false) => warn!(task_id = %self.task_id, "Task no longer running, job not recorded"),
            Err(e) => error!(task_id = %self.task_id, "Failed to record pending job: {}", e),
        }
    }
}

/// Durable task execution on a bounded worker pool.
#[derive(Clone)]
pub struct TaskScheduler {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    poller: CompletionPoller,
    callbacks: CallbackNotifier,
    workers: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    graph_submit_only: bool,
    resume_on_start: bool,
}

impl TaskScheduler {
    pub fn new(store: Store, orchestrator: Arc<Orchestrator>, config: &AppConfig) -> Self {
        Self {
            poller: CompletionPoller::new(store.clone(), orchestrator.clone(), config.poller.timeout()),
            callbacks: CallbackNotifier::new(&config.callback),
            workers: Arc::new(Semaphore::new(config.scheduler.workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            graph_submit_only: config.scheduler.graph_submit_only,
            resume_on_start: config.scheduler.resume_on_start,
            store,
            orchestrator,
        }
    }

    /// Synchronous invocation. A result that is still pending is adopted as
    /// a running task so its status can be queried later.
    pub async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, InvokeError> {
        let outcome = match self.orchestrator.invoke(&req, InvokeOptions::default()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(url) = &req.callback_url {
                    self.callbacks
                        .notify(url, CallbackPayload::failed(None, None, &e.to_string()));
                }
                return Err(e);
            }
        };

        match &outcome.result {
            Invocation::Completed(payload) => {
                if let Some(url) = &req.callback_url {
                    self.callbacks.notify(
                        url,
                        CallbackPayload::succeeded(None, Some(outcome.request_id.clone()), payload),
                    );
                }
                Ok(outcome.into_response(None))
            }
            Invocation::Pending(job) => {
                let task_id = uuid::Uuid::new_v4().to_string();
                self.store
                    .create_running_task_with_job(
                        &task_id,
                        &req.capability_id,
                        req.owner.as_deref(),
                        &serde_json::to_value(&req).map_err(anyhow::Error::from)?,
                        job,
                    )
                    .await?;
                info!(task_id = %task_id, job_id = %job.job_id, "Pending invocation adopted as task");
                Ok(outcome.into_response(Some(task_id)))
            }
        }
    }

    pub async fn enqueue(&self, req: InvokeRequest) -> Result<TaskHandle, InvokeError> {
        if self.store.get_capability(&req.capability_id).await?.is_none() {
            return Err(InvokeError::Config(format!(
                "unknown capability '{}'",
                req.capability_id
            )));
        }
        let task_id = uuid::Uuid::new_v4().to_string();
        let snapshot = serde_json::to_value(&req).map_err(anyhow::Error::from)?;
        self.store
            .create_task(&task_id, &req.capability_id, req.owner.as_deref(), &snapshot)
            .await?;
        info!(task_id = %task_id, capability = %req.capability_id, "Task queued");
        self.spawn_task(task_id.clone(), TaskStatus::Queued, 0);
        Ok(TaskHandle {
            task_id,
            status: TaskStatus::Queued,
        })
    }

    /// Current task state. A running task parked on an external job gets one
    /// completion check first; terminal tasks are returned as stored.
    pub async fn get_task(&self, id: &str) -> Result<Option<TaskSnapshot>, InvokeError> {
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(None);
        };
        if task.status == TaskStatus::Running
            && task.pending_job().is_some()
            && !self.in_flight.lock().await.contains(id)
        {
            let verdict = self.poller.refresh(&task).await?;
            return self.after_poll(&task, verdict).await;
        }
        Ok(Some(TaskSnapshot::from(&task)))
    }

    /// Explicit re-examination of a task, including the failed -> running
    /// revive path for tasks whose job is still alive.
    pub async fn recheck(&self, id: &str) -> Result<Option<TaskSnapshot>, InvokeError> {
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(None);
        };
        let verdict = match task.status {
            TaskStatus::Failed => self.poller.revive(&task).await?,
            TaskStatus::Running if !self.in_flight.lock().await.contains(id) => {
                self.poller.refresh(&task).await?
            }
            _ => PollVerdict::Unchanged,
        };
        self.after_poll(&task, verdict).await
    }

    async fn after_poll(
        &self,
        task: &TaskRecord,
        verdict: PollVerdict,
    ) -> Result<Option<TaskSnapshot>, InvokeError> {
        match &verdict {
            PollVerdict::Succeeded(payload) => self.notify(
                task,
                CallbackPayload::succeeded(Some(task.id.clone()), None, payload),
            ),
            PollVerdict::Failed(reason) => {
                self.notify(task, CallbackPayload::failed(Some(task.id.clone()), None, reason))
            }
            PollVerdict::Unchanged | PollVerdict::Superseded | PollVerdict::Revived => {}
        }
        if verdict == PollVerdict::Unchanged {
            return Ok(Some(TaskSnapshot::from(task)));
        }
        Ok(self.store.get_task(&task.id).await?.map(|t| TaskSnapshot::from(&t)))
    }

    fn notify(&self, task: &TaskRecord, payload: CallbackPayload) {
        if let Some(url) = callback_url(&task.request) {
            self.callbacks.notify(url, payload);
        }
    }

    /// Re-attach to work left behind by a previous process.
    pub async fn resume_incomplete(&self) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();
        for task in self.store.list_incomplete_tasks().await? {
            match task.status {
                TaskStatus::Queued => {
                    self.spawn_task(task.id.clone(), TaskStatus::Queued, task.attempts);
                    report.requeued += 1;
                }
                TaskStatus::Running if task.pending_job().is_some_and(PendingJob::is_resumable) => {
                    debug!(task_id = %task.id, "Task waits on an external job, not resubmitting");
                    report.awaiting_poll += 1;
                }
                TaskStatus::Running => {
                    self.spawn_task(task.id.clone(), TaskStatus::Running, task.attempts);
                    report.requeued += 1;
                }
                _ => {}
            }
        }
        info!(
            requeued = report.requeued,
            awaiting_poll = report.awaiting_poll,
            "Incomplete tasks resumed"
        );
        Ok(report)
    }

    pub fn spawn_task(&self, task_id: String, expected: TaskStatus, attempts: i64) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = this.workers.clone().acquire_owned().await else {
                debug!(task_id = %task_id, "Worker pool closed, task left for the next start");
                return;
            };
            this.run_task(&task_id, expected, attempts).await;
        })
    }

    async fn run_task(&self, task_id: &str, expected: TaskStatus, attempts: i64) {
        if !self.in_flight.lock().await.insert(task_id.to_string()) {
            debug!(task_id, "Task already in flight");
            return;
        }
        if let Err(e) = self.execute_task(task_id, expected, attempts).await {
            error!(task_id, "Task execution error: {}", e);
        }
        self.in_flight.lock().await.remove(task_id);
    }

    async fn execute_task(&self, task_id: &str, expected: TaskStatus, attempts: i64) -> Result<()> {
        if !self.store.claim_task(task_id, expected, attempts).await? {
            debug!(task_id, "Task claimed elsewhere, skipping");
            return Ok(());
        }
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };

        let req: InvokeRequest = match serde_json::from_value(task.request.clone()) {
            Ok(req) => req,
            Err(e) => {
                let reason = format!("unreadable task request: {e}");
                self.store.fail_task(task_id, &reason).await?;
                return Ok(());
            }
        };

        let mode = match self.store.get_capability(&req.capability_id).await? {
            Some(cap) if self.graph_submit_only && cap.provider.kind() == ProviderKind::NodeGraph => {
                ExecutionMode::SubmitOnly
            }
            _ => ExecutionMode::Wait,
        };
        let options = InvokeOptions {
            mode,
            task_id: Some(task_id.to_string()),
            sink: Some(Arc::new(TaskSubmissionSink {
                store: self.store.clone(),
                task_id: task_id.to_string(),
            })),
        };

        info!(task_id, attempt = task.attempts, "Task started");
        match self.orchestrator.invoke(&req, options).await {
            Ok(outcome) => match &outcome.result {
                Invocation::Completed(payload) => {
                    if self.store.complete_task(task_id, payload).await? {
                        info!(task_id, "Task succeeded");
                        self.notify(
                            &task,
                            CallbackPayload::succeeded(
                                Some(task_id.to_string()),
                                Some(outcome.request_id.clone()),
                                payload,
                            ),
                        );
                    }
                }
                Invocation::Pending(job) => {
                    self.store.attach_pending(task_id, job).await?;
                    info!(task_id, job_id = %job.job_id, "Task waiting on external job");
                }
            },
            Err(e) => {
                if self.store.fail_task(task_id, &e.to_string()).await? {
                    warn!(task_id, kind = e.kind(), "Task failed: {}", e);
                    self.notify(
                        &task,
                        CallbackPayload::failed(Some(task_id.to_string()), None, &e.to_string()),
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

fn callback_url(request: &Value) -> Option<&str> {
    request
        .get("callbackUrl")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl LifecycleComponent for TaskScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn on_start(&mut self) -> Result<()> {
        if self.resume_on_start {
            self.resume_incomplete().await?;
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.workers.close();
        let running = self.in_flight_count().await;
        if running > 0 {
            warn!(running, "Shutting down with tasks in flight; they resume on next start");
        }
        Ok(())
    }
}
