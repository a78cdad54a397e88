use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, params};

use super::types::{CostSnapshot, InvocationLogRecord, LogFinish, LogStatus, NewInvocationLog};
use super::{Store, from_millis, now_millis};

impl Store {
    /// Open an audit record before the provider is called.
    pub async fn insert_invocation_log(&self, log: &NewInvocationLog) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO invocation_logs (id, request_id, capability_id, task_id, request_json, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
            params![
                id,
                log.request_id,
                log.capability_id,
                log.task_id,
                log.request.to_string(),
                now_millis()
            ],
        )?;
        Ok(id)
    }

    /// The one closing update. Returns false when the record was already
    /// finished (or does not exist).
    pub async fn finish_invocation_log(&self, id: &str, finish: &LogFinish) -> Result<bool> {
        let response = finish.response.as_ref().map(|v| v.to_string());
        let cost = finish.cost.as_ref();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE invocation_logs SET status = ?1, executor_id = ?2, credential_id = ?3,
                    response_json = ?4, error = ?5, unit_price = ?6, quantity = ?7, total_cost = ?8,
                    currency = ?9, finished_at = ?10, duration_ms = ?11
             WHERE id = ?12 AND finished_at IS NULL",
            params![
                finish.status.as_str(),
                finish.executor_id,
                finish.credential_id,
                response,
                finish.error,
                cost.map(|c| c.unit_price),
                cost.map(|c| c.quantity),
                cost.map(|c| c.total),
                cost.map(|c| c.currency.clone()),
                now_millis(),
                finish.duration_ms,
                id
            ],
        )?;
        Ok(rows == 1)
    }

    pub async fn get_invocation_log(&self, id: &str) -> Result<Option<InvocationLogRecord>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT id, request_id, capability_id, executor_id, credential_id, task_id, request_json,
                        response_json, status, error, unit_price, quantity, total_cost, currency,
                        started_at, finished_at, duration_ms
                 FROM invocation_logs WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        (
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, Option<String>>(3)?,
                            r.get::<_, Option<i64>>(4)?,
                            r.get::<_, Option<String>>(5)?,
                        ),
                        (
                            r.get::<_, String>(6)?,
                            r.get::<_, Option<String>>(7)?,
                            r.get::<_, String>(8)?,
                            r.get::<_, Option<String>>(9)?,
                        ),
                        (
                            r.get::<_, Option<f64>>(10)?,
                            r.get::<_, Option<i64>>(11)?,
                            r.get::<_, Option<f64>>(12)?,
                            r.get::<_, Option<String>>(13)?,
                        ),
                        (
                            r.get::<_, i64>(14)?,
                            r.get::<_, Option<i64>>(15)?,
                            r.get::<_, Option<i64>>(16)?,
                        ),
                    ))
                },
            )
            .optional()?;
        drop(db);

        let Some((ids, body, cost, times)) = row else {
            return Ok(None);
        };
        let (id, request_id, capability_id, executor_id, credential_id, task_id) = ids;
        let (request_json, response_json, status, error) = body;
        let status = LogStatus::from_str_opt(&status)
            .ok_or_else(|| anyhow!("invocation log {id} has unknown status '{status}'"))?;
        let cost = match cost {
            (Some(unit_price), Some(quantity), Some(total), Some(currency)) => Some(CostSnapshot {
                unit_price,
                quantity,
                total,
                currency,
            }),
            _ => None,
        };

        Ok(Some(InvocationLogRecord {
            request: serde_json::from_str(&request_json)?,
            response: response_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status,
            error,
            cost,
            started_at: from_millis(times.0),
            finished_at: times.1.map(from_millis),
            duration_ms: times.2,
            id,
            request_id,
            capability_id,
            executor_id,
            credential_id,
            task_id,
        }))
    }
}
