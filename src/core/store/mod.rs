mod capabilities;
mod credentials;
mod executors;
mod invocation_logs;
mod tasks;
pub mod types;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::vault::SecretCipher;
use crate::platform::{NativePlatform, Platform};

/// SQLite-backed catalog, credential, task and audit store.
///
/// Contended mutations (credential usage/cooldown, task claims and
/// finalization, log finish) are single autocommitted statements guarded by
/// their expected current state, so two processes sharing the file never
/// both win the same transition.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    cipher: Arc<SecretCipher>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(path: P, cipher: SecretCipher) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        init_schema(&db)?;
        info!("Store opened at {}", path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            cipher: Arc::new(cipher),
        })
    }

    pub fn open_in_memory(cipher: SecretCipher) -> Result<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            cipher: Arc::new(cipher),
        })
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS capabilities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            vendor TEXT NOT NULL,
            executor_id TEXT,
            provider_json TEXT NOT NULL,
            default_params TEXT NOT NULL,
            input_schema TEXT NOT NULL,
            status TEXT NOT NULL,
            requires_image INTEGER NOT NULL DEFAULT 0,
            pricing_json TEXT,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS executors (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            vendor TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            auth_json TEXT NOT NULL,
            max_concurrency INTEGER NOT NULL DEFAULT 4,
            health TEXT NOT NULL DEFAULT 'healthy',
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vendor TEXT NOT NULL,
            label TEXT,
            key_id TEXT,
            secret TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            expires_at INTEGER,
            cooldown_until INTEGER,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_credentials_vendor ON credentials(vendor, status)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS executor_credentials (
            executor_id TEXT NOT NULL,
            credential_id INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (executor_id, credential_id)
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            capability_id TEXT NOT NULL,
            owner TEXT,
            status TEXT NOT NULL,
            request_json TEXT NOT NULL,
            result_kind TEXT,
            result_json TEXT,
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS invocation_logs (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            capability_id TEXT NOT NULL,
            executor_id TEXT,
            credential_id INTEGER,
            task_id TEXT,
            request_json TEXT NOT NULL,
            response_json TEXT,
            status TEXT NOT NULL,
            error TEXT,
            unit_price REAL,
            quantity INTEGER,
            total_cost REAL,
            currency TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            duration_ms INTEGER
        )",
        [],
    )?;

    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    let cipher = SecretCipher::with_key(&[3u8; 32]).unwrap();
    Store::open_in_memory(cipher).unwrap()
}
