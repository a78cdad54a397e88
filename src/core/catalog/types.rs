use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::providers::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Image,
    Video,
    Text,
    Enhance,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Image => "image",
            Category::Video => "video",
            Category::Text => "text",
            Category::Enhance => "enhance",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Category::Image),
            "video" => Some(Category::Video),
            "text" => Some(Category::Text),
            "enhance" => Some(Category::Enhance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Active,
    Disabled,
}

impl CapabilityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityStatus::Active => "active",
            CapabilityStatus::Disabled => "disabled",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CapabilityStatus::Active),
            "disabled" => Some(CapabilityStatus::Disabled),
            _ => None,
        }
    }
}

fn default_capability_status() -> CapabilityStatus {
    CapabilityStatus::Active
}

/// How a capability reaches its backend. The variant fixes the provider kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSpec {
    Http(HttpSpec),
    NodeGraph(GraphSpec),
    JobQueue(QueueSpec),
}

impl ProviderSpec {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSpec::Http(_) => ProviderKind::Http,
            ProviderSpec::NodeGraph(_) => ProviderKind::NodeGraph,
            ProviderSpec::JobQueue(_) => ProviderKind::JobQueue,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub path: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Request field receiving input media URLs.
    #[serde(default)]
    pub media_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Node graph in the runner's API format: `{node_id: {class_type, inputs}}`.
    pub workflow: Value,
    /// Caller parameter key → `"node_id.input_name"`.
    #[serde(default)]
    pub node_map: BTreeMap<String, String>,
    /// Parameter holding the number of outputs per run.
    #[serde(default)]
    pub batch_param: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub submit_path: String,
    /// Polled path, `{id}` is replaced with the vendor job id.
    pub status_path: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub media_field: Option<String>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub unit_price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: Category,
    /// Credential namespace.
    pub vendor: String,
    #[serde(default)]
    pub executor_id: Option<String>,
    pub provider: ProviderSpec,
    #[serde(default)]
    pub default_params: Map<String, Value>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default = "default_capability_status")]
    pub status: CapabilityStatus,
    #[serde(default)]
    pub requires_image: bool,
    #[serde(default)]
    pub pricing: Option<Pricing>,
}

impl Capability {
    /// Keys listed under `input_schema.required`.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
    Header {
        name: String,
    },
    Query {
        name: String,
    },
    TokenExchange {
        token_url: String,
        #[serde(default = "default_token_ttl")]
        ttl_secs: u64,
    },
}

fn default_token_ttl() -> u64 {
    1800
}

impl AuthMode {
    pub fn requires_credential(&self) -> bool {
        !matches!(self, AuthMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorHealth {
    #[default]
    Healthy,
    Degraded,
    Down,
}

impl ExecutorHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorHealth::Healthy => "healthy",
            ExecutorHealth::Degraded => "degraded",
            ExecutorHealth::Down => "down",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "healthy" => Some(ExecutorHealth::Healthy),
            "degraded" => Some(ExecutorHealth::Degraded),
            "down" => Some(ExecutorHealth::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub credential_id: i64,
    #[serde(default)]
    pub priority: i64,
}

/// A concrete backend endpoint serving one provider kind for one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorRecord {
    pub id: String,
    pub provider: ProviderKind,
    pub vendor: String,
    pub endpoint: String,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub health: ExecutorHealth,
    /// Loaded from the binding table, ascending priority.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<CredentialBinding>,
}

fn default_max_concurrency() -> u32 {
    4
}
