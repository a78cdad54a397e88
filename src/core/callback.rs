use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::CallbackConfig;
use crate::core::normalize::CanonicalPayload;

pub const SIGNATURE_HEADER: &str = "X-Capflow-Signature";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub request_id: Option<String>,
    pub status: String,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub texts: Vec<String>,
    pub error: Option<String>,
}

impl CallbackPayload {
    pub fn succeeded(task_id: Option<String>, request_id: Option<String>, payload: &CanonicalPayload) -> Self {
        Self {
            task_id,
            request_id,
            status: "succeeded".into(),
            images: payload.images.clone(),
            videos: payload.videos.clone(),
            texts: payload.texts.clone(),
            error: None,
        }
    }

    pub fn failed(task_id: Option<String>, request_id: Option<String>, error: &str) -> Self {
        Self {
            task_id,
            request_id,
            status: "failed".into(),
            images: Vec::new(),
            videos: Vec::new(),
            texts: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// `sha256=<hex>` HMAC of the exact body bytes.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Fire-and-forget terminal notifications. One attempt, failures are logged.
#[derive(Clone)]
pub struct CallbackNotifier {
    client: Client,
    secret: Option<String>,
}

impl CallbackNotifier {
    pub fn new(config: &CallbackConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            secret: config.secret.clone().filter(|s| !s.is_empty()),
        }
    }

    pub fn notify(&self, url: &str, payload: CallbackPayload) -> JoinHandle<()> {
        let client = self.client.clone();
        let secret = self.secret.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to encode callback payload: {}", e);
                    return;
                }
            };
            let mut request = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            if let Some(signature) = secret.as_deref().and_then(|s| sign(s, &body)) {
                request = request.header(SIGNATURE_HEADER, signature);
            }
            match request.body(body).send().await {
                Ok(res) if res.status().is_success() => {
                    info!(url = %url, status = %payload.status, "Callback delivered");
                }
                Ok(res) => warn!(url = %url, "Callback rejected with {}", res.status()),
                Err(e) => warn!(url = %url, "Callback failed: {}", e),
            }
        })
    }
}
