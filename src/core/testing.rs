//! Scriptable vendor server and catalog fixtures shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::core::catalog::types::{
    AuthMode, Capability, CapabilityStatus, Category, ExecutorHealth, ExecutorRecord, GraphSpec,
    HttpSpec, ProviderSpec, QueueSpec,
};
use crate::core::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::providers::{ProviderKind, ProviderManager};
use crate::core::storage::LocalObjectStorage;
use crate::core::store::Store;
use crate::core::store::types::{CredentialRecord, CredentialStatus, NewCredential};

/// 1x1 transparent PNG.
pub const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

pub fn png_bytes() -> Vec<u8> {
    crate::core::normalize::decode_base64(PNG_B64).unwrap_or_default()
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    status: u16,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
            headers: vec![("content-type".into(), "application/json".into())],
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>, content_type: &str) -> Self {
        Self {
            status,
            body,
            headers: vec![("content-type".into(), content_type.into())],
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, `Null` for anything else.
    pub body: Value,
    pub raw: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }
}

type RouteKey = (String, String);

#[derive(Default)]
struct MockState {
    routes: Mutex<HashMap<RouteKey, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Axum server answering scripted responses per method and path. Each
/// route serves its queue in order and keeps repeating the last entry.
pub struct MockVendor {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

async fn mock_handler(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        raw: body,
    };
    state
        .requests
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(recorded);

    let response = {
        let mut routes = state.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .get_mut(&(method.to_string(), path))
            .and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
    };

    match response {
        Some(r) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(r.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in &r.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder
                .body(axum::body::Body::from(r.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"error": "no scripted response"}).to_string(),
        )
            .into_response(),
    }
}

impl MockVendor {
    /// `None` when the sandbox forbids binding a socket.
    pub async fn start() -> Option<Self> {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) => {
                eprintln!("Skipping mock vendor test: socket bind failed: {err}");
                return None;
            }
        };
        let addr = listener.local_addr().ok()?;
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Some(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn respond(&self, method: &str, path: &str, responses: Vec<MockResponse>) {
        self.state
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((method.to_string(), path.to_string()), responses.into());
    }

    pub fn requests(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests(method, path).len()
    }
}

impl Drop for MockVendor {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// --- catalog fixtures ---

pub fn http_capability(id: &str, path: &str) -> Capability {
    Capability {
        id: id.to_string(),
        name: id.to_string(),
        category: Category::Image,
        vendor: "acme".into(),
        executor_id: None,
        provider: ProviderSpec::Http(HttpSpec {
            path: path.to_string(),
            model: None,
            media_field: None,
        }),
        default_params: Default::default(),
        input_schema: json!({"required": ["prompt"]}),
        status: CapabilityStatus::Active,
        requires_image: false,
        pricing: None,
    }
}

pub fn http_executor(id: &str, endpoint: &str) -> ExecutorRecord {
    ExecutorRecord {
        id: id.to_string(),
        provider: ProviderKind::Http,
        vendor: "acme".into(),
        endpoint: endpoint.to_string(),
        auth: AuthMode::Bearer,
        max_concurrency: 4,
        health: ExecutorHealth::Healthy,
        bindings: vec![],
    }
}

/// Two-node graph: a prompt node feeding a sampler with a seed input.
pub fn graph_capability(id: &str) -> Capability {
    Capability {
        id: id.to_string(),
        name: id.to_string(),
        category: Category::Image,
        vendor: "comfy".into(),
        executor_id: None,
        provider: ProviderSpec::NodeGraph(GraphSpec {
            workflow: json!({
                "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
                "3": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20}},
                "10": {"class_type": "LoadImage", "inputs": {"image": ""}}
            }),
            node_map: [
                ("prompt".to_string(), "6.text".to_string()),
                ("seed".to_string(), "3.seed".to_string()),
                ("image".to_string(), "10.image".to_string()),
            ]
            .into_iter()
            .collect(),
            batch_param: Some("batch_size".into()),
            timeout_secs: None,
        }),
        default_params: Default::default(),
        input_schema: json!({"required": ["prompt"]}),
        status: CapabilityStatus::Active,
        requires_image: false,
        pricing: None,
    }
}

pub fn graph_executor(id: &str, endpoint: &str) -> ExecutorRecord {
    ExecutorRecord {
        id: id.to_string(),
        provider: ProviderKind::NodeGraph,
        vendor: "comfy".into(),
        endpoint: endpoint.to_string(),
        auth: AuthMode::None,
        max_concurrency: 2,
        health: ExecutorHealth::Healthy,
        bindings: vec![],
    }
}

pub fn queue_capability(id: &str) -> Capability {
    Capability {
        id: id.to_string(),
        name: id.to_string(),
        category: Category::Video,
        vendor: "kling".into(),
        executor_id: None,
        provider: ProviderSpec::JobQueue(QueueSpec {
            submit_path: "/v1/videos".into(),
            status_path: "/v1/videos/{id}".into(),
            model: Some("kling-v2".into()),
            media_field: Some("image_url".into()),
            deadline_secs: None,
        }),
        default_params: Default::default(),
        input_schema: json!({"required": ["prompt"]}),
        status: CapabilityStatus::Active,
        requires_image: false,
        pricing: None,
    }
}

pub fn queue_executor(id: &str, endpoint: &str) -> ExecutorRecord {
    ExecutorRecord {
        id: id.to_string(),
        provider: ProviderKind::JobQueue,
        vendor: "kling".into(),
        endpoint: endpoint.to_string(),
        auth: AuthMode::Bearer,
        max_concurrency: 4,
        health: ExecutorHealth::Healthy,
        bindings: vec![],
    }
}

pub fn credential(id: i64, vendor: &str) -> CredentialRecord {
    CredentialRecord {
        id,
        vendor: vendor.to_string(),
        label: None,
        key_id: None,
        secret: format!("secret-{id}"),
        status: CredentialStatus::Active,
        usage_count: 0,
        last_used_at: None,
        expires_at: None,
        cooldown_until: None,
    }
}

/// History entry of a finished graph run with one saved image per name.
pub fn graph_history(prompt_id: &str, filenames: &[&str]) -> Value {
    let images: Vec<Value> = filenames
        .iter()
        .map(|f| json!({"filename": f, "subfolder": "", "type": "output"}))
        .collect();
    json!({
        prompt_id: {
            "prompt": [],
            "outputs": {"9": {"images": images}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    })
}

// --- orchestration environment ---

/// Config with millisecond cadences so polling tests finish quickly.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.http.retry_backoff_ms = 5;
    config.graph.poll_interval_ms = 10;
    config.graph.timeout_secs = 5;
    config.queue.initial_backoff_ms = 10;
    config.queue.max_backoff_ms = 20;
    config.queue.deadline_secs = 2;
    config.poller.timeout_secs = 2;
    config.scheduler.workers = 2;
    config
}

/// Store, object storage and orchestrator wired like the real runtime.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub config: AppConfig,
    pub store: Store,
    pub storage: Arc<LocalObjectStorage>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = crate::core::store::test_store();
        let storage = Arc::new(
            LocalObjectStorage::new(dir.path().join("objects"), "http://media.test")
                .await
                .expect("object storage"),
        );
        let providers = Arc::new(ProviderManager::with_defaults(&config, storage.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            providers,
            storage.clone(),
            &config,
        ));
        Self {
            dir,
            config,
            store,
            storage,
            orchestrator,
        }
    }

    pub async fn add_credential(&self, vendor: &str, secret: &str) -> i64 {
        self.store
            .insert_credential(&NewCredential {
                vendor: vendor.to_string(),
                secret: secret.to_string(),
                ..Default::default()
            })
            .await
            .expect("insert credential")
    }

    pub async fn add(&self, capability: &Capability, executor: &ExecutorRecord) {
        self.store
            .upsert_executor(executor)
            .await
            .expect("upsert executor");
        self.store
            .upsert_capability(capability)
            .await
            .expect("upsert capability");
    }
}
