mod handlers;
mod router;

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use tokio::sync::{broadcast, oneshot};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::runtime::Runtime;
use crate::core::scheduler::TaskScheduler;
use crate::core::storage::LocalObjectStorage;
use crate::core::store::Store;

use router::build_api_router;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) scheduler: TaskScheduler,
    pub(crate) store: Store,
    pub(crate) storage: Arc<LocalObjectStorage>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl AppState {
    pub(crate) fn from_runtime(runtime: &Runtime, log_tx: broadcast::Sender<String>) -> Self {
        Self {
            scheduler: runtime.scheduler.clone(),
            store: runtime.store.clone(),
            storage: runtime.storage.clone(),
            log_tx,
            api_port: runtime.config.server.port,
        }
    }
}

/// HTTP API over the runtime, started and stopped through the lifecycle.
pub struct ApiServer {
    state: AppState,
    api_host: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(runtime: &Runtime, log_tx: broadcast::Sender<String>) -> Self {
        Self {
            state: AppState::from_runtime(runtime, log_tx),
            api_host: runtime.config.server.host.clone(),
            shutdown_tx: None,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.state.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_api_router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
