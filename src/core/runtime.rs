use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::config::{AppConfig, DATABASE_FILE};
use crate::core::orchestrator::Orchestrator;
use crate::core::providers::ProviderManager;
use crate::core::scheduler::TaskScheduler;
use crate::core::storage::{LocalObjectStorage, ObjectStorage};
use crate::core::store::Store;
use crate::core::vault::SecretCipher;
use crate::platform::{NativePlatform, Platform};

/// Everything a running capflow process shares, built from one data directory.
#[derive(Clone)]
pub struct Runtime {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub store: Store,
    pub storage: Arc<LocalObjectStorage>,
    pub scheduler: TaskScheduler,
}

impl Runtime {
    pub async fn build(data_dir: &Path, config: AppConfig) -> Result<Self> {
        let cipher = SecretCipher::new().context("initializing credential cipher")?;
        let db_path = data_dir.join(DATABASE_FILE);
        let store = Store::open(&db_path, cipher).await?;
        NativePlatform::restrict_file_permissions(&db_path);

        let storage = Arc::new(
            LocalObjectStorage::new(config.storage_dir(data_dir), &config.public_base_url())
                .await?,
        );
        let shared: Arc<dyn ObjectStorage> = storage.clone();
        let providers = Arc::new(ProviderManager::with_defaults(&config, shared.clone()));
        info!(
            kinds = ?providers.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "Provider executors registered"
        );
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), providers, shared, &config));
        let scheduler = TaskScheduler::new(store.clone(), orchestrator, &config);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            store,
            storage,
            scheduler,
        })
    }
}
