use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Active,
    Disabled,
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::Revoked => "revoked",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CredentialStatus::Active),
            "disabled" => Some(CredentialStatus::Disabled),
            "revoked" => Some(CredentialStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub vendor: String,
    pub label: Option<String>,
    pub key_id: Option<String>,
    /// Decrypted. Never serialized.
    #[serde(skip_serializing)]
    pub secret: String,
    pub status: CredentialStatus,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == CredentialStatus::Active
            && self.expires_at.is_none_or(|at| at > now)
            && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewCredential {
    pub vendor: String,
    pub label: Option<String>,
    pub key_id: Option<String>,
    pub secret: String,
    pub status: CredentialStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Running,
    Succeeded,
    Failed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Succeeded => "succeeded",
            LogStatus::Failed => "failed",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "running" => Some(LogStatus::Running),
            "succeeded" => Some(LogStatus::Succeeded),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub unit_price: f64,
    pub quantity: i64,
    pub total: f64,
    pub currency: String,
}

impl CostSnapshot {
    pub fn new(unit_price: f64, quantity: usize, currency: &str) -> Self {
        let quantity = quantity as i64;
        Self {
            unit_price,
            quantity,
            total: unit_price * quantity as f64,
            currency: currency.to_string(),
        }
    }
}

/// Opening half of an audit record, written before the provider is called.
#[derive(Debug, Clone)]
pub struct NewInvocationLog {
    pub request_id: String,
    pub capability_id: String,
    pub task_id: Option<String>,
    /// Already sanitized.
    pub request: Value,
}

/// The single closing update of an audit record.
#[derive(Debug, Clone)]
pub struct LogFinish {
    pub status: LogStatus,
    pub executor_id: Option<String>,
    pub credential_id: Option<i64>,
    /// Already sanitized.
    pub response: Option<Value>,
    pub error: Option<String>,
    pub cost: Option<CostSnapshot>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationLogRecord {
    pub id: String,
    pub request_id: String,
    pub capability_id: String,
    pub executor_id: Option<String>,
    pub credential_id: Option<i64>,
    pub task_id: Option<String>,
    pub request: Value,
    pub response: Option<Value>,
    pub status: LogStatus,
    pub error: Option<String>,
    pub cost: Option<CostSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}
