use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use flux_core::telemetry::init_telemetry;
use flux_server::config::ServerConfig;
use flux_server::{FluxServer, Stores};
use flux_storage::{generate_master_key, FsOutputStore, InlineOutputStore, MasterKey};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry("flux_server=info,flux_core=info,flux_storage=info");

    let config = ServerConfig::from_env()?;
    info!(addr = %config.bind_addr(), "flux-server starting");

    let master_key = match &config.master_key {
        Some(encoded) => MasterKey::from_base64(encoded).context("invalid FLUX_MASTER_KEY")?,
        None => {
            warn!("FLUX_MASTER_KEY not set; using an ephemeral key (secrets will not survive restarts)");
            MasterKey::from_base64(&generate_master_key())
                .context("failed to build ephemeral master key")?
        }
    };

    if config.serializer == flux_server::config::Serializer::Binary {
        warn!("binary output serialization is not wired to a codec yet; storing json");
    }
    let output: Arc<dyn flux_core::OutputStore> = match &config.local_storage_path {
        Some(path) => Arc::new(FsOutputStore::new(path.clone())),
        None => Arc::new(InlineOutputStore::new()),
    };

    let stores = match &config.database_url {
        Some(url) => {
            info!("using PostgreSQL stores");
            Stores::postgres(url, master_key, output)
                .await
                .context("failed to connect to database")?
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            let mut stores = Stores::in_memory(master_key);
            stores.output = output;
            stores
        }
    };

    let server = FluxServer::new(config.clone(), stores);
    let (shutdown, handles) = server.spawn_background();

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!("listening on {}", config.bind_addr());

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, server.router())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    info!("flux-server stopped");
    Ok(())
}
