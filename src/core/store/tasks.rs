use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::{Store, from_millis, now_millis};
use crate::core::normalize::CanonicalPayload;
use crate::core::providers::PendingJob;
use crate::core::scheduler::types::{TaskRecord, TaskResult, TaskStatus};

const TASK_COLUMNS: &str = "id, capability_id, owner, status, request_json, result_kind, \
     result_json, error, attempts, created_at, updated_at, started_at, finished_at";

struct TaskRow {
    id: String,
    capability_id: String,
    owner: Option<String>,
    status: String,
    request_json: String,
    result_kind: Option<String>,
    result_json: Option<String>,
    error: Option<String>,
    attempts: i64,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            capability_id: row.get(1)?,
            owner: row.get(2)?,
            status: row.get(3)?,
            request_json: row.get(4)?,
            result_kind: row.get(5)?,
            result_json: row.get(6)?,
            error: row.get(7)?,
            attempts: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord> {
        let status = TaskStatus::from_str_opt(&self.status)
            .ok_or_else(|| anyhow!("task {} has unknown status '{}'", self.id, self.status))?;
        let result = match (self.result_kind.as_deref(), self.result_json.as_deref()) {
            (Some("completed"), Some(json)) => Some(TaskResult::Completed(serde_json::from_str(json)?)),
            (Some("pending"), Some(json)) => Some(TaskResult::Pending(serde_json::from_str(json)?)),
            (None, _) | (_, None) => None,
            (Some(other), _) => return Err(anyhow!("task {} has unknown result kind '{other}'", self.id)),
        };
        Ok(TaskRecord {
            status,
            result,
            request: serde_json::from_str(&self.request_json)?,
            id: self.id,
            capability_id: self.capability_id,
            owner: self.owner,
            error: self.error,
            attempts: self.attempts,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            started_at: self.started_at.map(from_millis),
            finished_at: self.finished_at.map(from_millis),
        })
    }
}

impl Store {
    pub async fn create_task(
        &self,
        id: &str,
        capability_id: &str,
        owner: Option<&str>,
        request: &Value,
    ) -> Result<()> {
        let now = now_millis();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (id, capability_id, owner, status, request_json, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?5)",
            params![id, capability_id, owner, request.to_string(), now],
        )?;
        Ok(())
    }

    /// Adopt a job submitted outside the worker pool as a running task.
    pub async fn create_running_task_with_job(
        &self,
        id: &str,
        capability_id: &str,
        owner: Option<&str>,
        request: &Value,
        job: &PendingJob,
    ) -> Result<()> {
        let now = now_millis();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (id, capability_id, owner, status, request_json, result_kind, result_json,
                                attempts, created_at, updated_at, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4, 'pending', ?5, 1, ?6, ?6, ?6)",
            params![
                id,
                capability_id,
                owner,
                request.to_string(),
                serde_json::to_string(job)?,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::from_row,
            )
            .optional()?
        };
        row.map(TaskRow::into_record).transpose()
    }

    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], TaskRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    /// Queued and running tasks, oldest first.
    pub async fn list_incomplete_tasks(&self) -> Result<Vec<TaskRecord>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('queued', 'running')
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], TaskRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    /// Compare-and-set claim: only succeeds while the task is still in
    /// `expected` with `expected_attempts` recorded attempts.
    pub async fn claim_task(
        &self,
        id: &str,
        expected: TaskStatus,
        expected_attempts: i64,
    ) -> Result<bool> {
        let now = now_millis();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE tasks SET status = 'running', attempts = attempts + 1,
                    started_at = COALESCE(started_at, ?1), updated_at = ?1
             WHERE id = ?2 AND status = ?3 AND attempts = ?4",
            params![now, id, expected.as_str(), expected_attempts],
        )?;
        Ok(rows == 1)
    }

    pub async fn attach_pending(&self, id: &str, job: &PendingJob) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE tasks SET result_kind = 'pending', result_json = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![serde_json::to_string(job)?, now_millis(), id],
        )?;
        Ok(rows == 1)
    }

    pub async fn complete_task(&self, id: &str, payload: &CanonicalPayload) -> Result<bool> {
        let now = now_millis();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE tasks SET status = 'succeeded', result_kind = 'completed', result_json = ?1,
                    error = NULL, updated_at = ?2, finished_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![serde_json::to_string(payload)?, now, id],
        )?;
        Ok(rows == 1)
    }

    /// Keeps any pending job on the task so a recheck can revive it.
    pub async fn fail_task(&self, id: &str, error: &str) -> Result<bool> {
        let now = now_millis();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE tasks SET status = 'failed', error = ?1, updated_at = ?2, finished_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![error, now, id],
        )?;
        Ok(rows == 1)
    }

    /// `failed -> running`, only for tasks carrying a pending job.
    pub async fn revive_task(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE tasks SET status = 'running', error = NULL, finished_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed' AND result_kind = 'pending'",
            params![now_millis(), id],
        )?;
        Ok(rows == 1)
    }
}
