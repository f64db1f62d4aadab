use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flux_core::telemetry::init_telemetry;
use flux_worker::{http_gateway, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry("flux_worker=info,flux_core=info");

    let config = WorkerConfig::from_env()?;
    info!(server = %config.server_url, session = %config.session_name, "flux-worker starting");

    let gateway = http_gateway(&config.server_url);
    let worker = Arc::new(Worker::new(config, gateway));
    // Workflows are compiled objects; deployments embed this crate and
    // call `worker.register_workflow(...)` before running.

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    worker.run(shutdown).await?;
    Ok(())
}
