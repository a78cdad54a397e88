use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, now_millis};
use crate::core::catalog::types::{CredentialBinding, ExecutorHealth, ExecutorRecord};
use crate::core::providers::ProviderKind;

const EXECUTOR_COLUMNS: &str =
    "id, provider, vendor, endpoint, auth_json, max_concurrency, health";

type ExecutorRow = (String, String, String, String, String, i64, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<ExecutorRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_record(row: ExecutorRow, bindings: Vec<CredentialBinding>) -> Result<ExecutorRecord> {
    let (id, provider, vendor, endpoint, auth_json, max_concurrency, health) = row;
    Ok(ExecutorRecord {
        provider: ProviderKind::from_str_opt(&provider)
            .ok_or_else(|| anyhow!("executor {} has unknown provider '{}'", id, provider))?,
        health: ExecutorHealth::from_str_opt(&health)
            .ok_or_else(|| anyhow!("executor {} has unknown health '{}'", id, health))?,
        auth: serde_json::from_str(&auth_json)?,
        max_concurrency: u32::try_from(max_concurrency.max(1)).unwrap_or(1),
        id,
        vendor,
        endpoint,
        bindings,
    })
}

impl Store {
    /// Bindings are managed separately through [`Store::bind_credential`].
    pub async fn upsert_executor(&self, executor: &ExecutorRecord) -> Result<()> {
        let auth_json = serde_json::to_string(&executor.auth)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO executors (id, provider, vendor, endpoint, auth_json, max_concurrency, health, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                vendor = excluded.vendor,
                endpoint = excluded.endpoint,
                auth_json = excluded.auth_json,
                max_concurrency = excluded.max_concurrency,
                health = excluded.health,
                updated_at = excluded.updated_at",
            params![
                executor.id,
                executor.provider.as_str(),
                executor.vendor,
                executor.endpoint,
                auth_json,
                i64::from(executor.max_concurrency),
                executor.health.as_str(),
                now_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn set_executor_health(&self, id: &str, health: ExecutorHealth) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executors SET health = ?1, updated_at = ?2 WHERE id = ?3",
            params![health.as_str(), now_millis(), id],
        )?;
        Ok(rows > 0)
    }

    pub async fn bind_credential(
        &self,
        executor_id: &str,
        credential_id: i64,
        priority: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO executor_credentials (executor_id, credential_id, priority)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(executor_id, credential_id) DO UPDATE SET priority = excluded.priority",
            params![executor_id, credential_id, priority],
        )?;
        Ok(())
    }

    pub async fn list_bindings(&self, executor_id: &str) -> Result<Vec<CredentialBinding>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT credential_id, priority FROM executor_credentials
             WHERE executor_id = ?1 ORDER BY priority ASC, credential_id ASC",
        )?;
        let rows = stmt.query_map(params![executor_id], |row| {
            Ok(CredentialBinding {
                credential_id: row.get(0)?,
                priority: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn get_executor(&self, id: &str) -> Result<Option<ExecutorRecord>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!("SELECT {EXECUTOR_COLUMNS} FROM executors WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?
        };
        match row {
            Some(row) => {
                let bindings = self.list_bindings(id).await?;
                Ok(Some(into_record(row, bindings)?))
            }
            None => Ok(None),
        }
    }

    /// Best available executor for a provider kind and vendor: healthy before
    /// degraded, `down` never.
    pub async fn find_executor(
        &self,
        provider: ProviderKind,
        vendor: &str,
    ) -> Result<Option<ExecutorRecord>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!(
                    "SELECT {EXECUTOR_COLUMNS} FROM executors
                     WHERE provider = ?1 AND vendor = ?2 AND health != 'down'
                     ORDER BY CASE health WHEN 'healthy' THEN 0 ELSE 1 END, id ASC
                     LIMIT 1"
                ),
                params![provider.as_str(), vendor],
                read_row,
            )
            .optional()?
        };
        match row {
            Some(row) => {
                let bindings = self.list_bindings(&row.0).await?;
                Ok(Some(into_record(row, bindings)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_executors(&self) -> Result<Vec<ExecutorRecord>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {EXECUTOR_COLUMNS} FROM executors ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let bindings = self.list_bindings(&row.0).await?;
            out.push(into_record(row, bindings)?);
        }
        Ok(out)
    }
}
