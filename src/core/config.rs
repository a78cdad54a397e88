use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "capflow.db";

/// Runtime settings read from `<data_dir>/config.toml`. Every field has a
/// default, so a missing file or a missing section is not an error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub credentials: CredentialConfig,
    pub http: HttpConfig,
    pub graph: GraphConfig,
    pub queue: QueueConfig,
    pub poller: PollerConfig,
    pub callback: CallbackConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to build stored-object links.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17990,
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub resume_on_start: bool,
    /// Node-graph tasks return right after submission and finish through the poller.
    pub graph_submit_only: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resume_on_start: true,
            graph_submit_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub cooldown_secs: u64,
    pub max_attempts: usize,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 120,
            max_attempts: 3,
        }
    }
}

impl CredentialConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub transient_retries: u32,
    pub retry_backoff_ms: u64,
    pub token_cache_capacity: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            transient_retries: 2,
            retry_backoff_ms: 500,
            token_cache_capacity: 64,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub per_extra_output_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: 180,
            per_extra_output_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub deadline_secs: u64,
    pub max_repairs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2500,
            max_backoff_ms: 8000,
            backoff_factor: 1.5,
            deadline_secs: 90,
            max_repairs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl PollerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// HMAC-SHA256 key for `X-Capflow-Signature`. Unsigned when absent.
    pub secret: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn public_base_url(&self) -> String {
        match &self.server.public_base_url {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }

    pub fn storage_dir(&self, data_dir: &Path) -> PathBuf {
        self.storage
            .dir
            .clone()
            .unwrap_or_else(|| data_dir.join("objects"))
    }
}
