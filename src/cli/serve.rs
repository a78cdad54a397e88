use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::runtime::Runtime;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::ApiServer;
use crate::logging::init_tracing;
use crate::platform::{NativePlatform, Platform};

pub async fn run_serve(data_dir: &Path, mut config: AppConfig, host: String, port: u16) -> Result<()> {
    config.server.host = host;
    config.server.port = port;
    let log_tx = init_tracing(&config.log.level, false);

    tokio::fs::create_dir_all(data_dir).await?;
    NativePlatform::restrict_dir_permissions(data_dir);
    info!("Starting capflow (data dir: {})", data_dir.display());

    let runtime = Runtime::build(data_dir, config).await?;
    let api_url = format!(
        "http://{}:{}",
        runtime.config.server.host, runtime.config.server.port
    );

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(&runtime, log_tx))));
    lifecycle.attach(Arc::new(Mutex::new(runtime.scheduler.clone())));
    lifecycle.start().await?;

    GuideSection::new("capflow")
        .link("API Endpoint", &api_url)
        .status("Public URL", &runtime.config.public_base_url())
        .status("Data Dir", &runtime.data_dir.display().to_string())
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down capflow...");
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
