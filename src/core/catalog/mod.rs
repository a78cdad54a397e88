pub mod types;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::store::Store;
use crate::core::store::types::{CredentialStatus, NewCredential};
use types::{Capability, ExecutorRecord};

/// Catalog file loaded by `capflow seed`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub executors: Vec<ExecutorRecord>,
    pub capabilities: Vec<Capability>,
    pub credentials: Vec<SeedCredential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCredential {
    pub vendor: String,
    pub secret: String,
    #[serde(default)]
    pub key_id: Option<String>,
    /// Seeding upserts by `(vendor, label)`; unlabeled entries always insert.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default)]
    pub bindings: Vec<SeedBinding>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedBinding {
    pub executor_id: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub executors: usize,
    pub capabilities: usize,
    pub credentials_added: usize,
    pub credentials_updated: usize,
    pub bindings: usize,
}

pub async fn load_seed_file(path: &Path) -> Result<CatalogSeed> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading catalog file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing catalog file {}", path.display()))
}

pub async fn apply_seed(store: &Store, seed: &CatalogSeed) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    for executor in &seed.executors {
        store.upsert_executor(executor).await?;
        report.executors += 1;
    }
    for capability in &seed.capabilities {
        store.upsert_capability(capability).await?;
        report.capabilities += 1;
    }

    for entry in &seed.credentials {
        let new = NewCredential {
            vendor: entry.vendor.clone(),
            label: entry.label.clone(),
            key_id: entry.key_id.clone(),
            secret: entry.secret.clone(),
            status: entry.status,
            expires_at: entry.expires_at,
        };
        let existing = match &entry.label {
            Some(label) => store.find_credential_by_label(&entry.vendor, label).await?,
            None => None,
        };
        let id = match existing {
            Some(found) => {
                store.update_credential(found.id, &new).await?;
                report.credentials_updated += 1;
                found.id
            }
            None => {
                report.credentials_added += 1;
                store.insert_credential(&new).await?
            }
        };
        for binding in &entry.bindings {
            store
                .bind_credential(&binding.executor_id, id, binding.priority)
                .await?;
            report.bindings += 1;
        }
    }

    info!(
        executors = report.executors,
        capabilities = report.capabilities,
        credentials_added = report.credentials_added,
        credentials_updated = report.credentials_updated,
        "Catalog seeded"
    );
    Ok(report)
}
