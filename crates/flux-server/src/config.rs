//! Server configuration from environment variables

use std::time::Duration;

use anyhow::{Context, Result};

/// All recognized server options. Everything except `database_url` has a
/// default; without a `DATABASE_URL` the server runs on in-memory stores.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,

    /// How long a claimed execution may wait for the worker's first
    /// checkpoint before it goes back to the queue.
    pub claim_ack_timeout: Duration,
    pub max_claim_attempts: u32,

    /// How long a disconnected worker's executions stay parked before
    /// reassignment.
    pub orphan_timeout: Duration,
    pub heartbeat_timeout: Duration,

    /// Grace period for a worker to acknowledge a cancellation.
    pub cancel_grace: Duration,

    pub scheduler_tick: Duration,
    pub dispatcher_tick: Duration,

    /// Base64-encoded 32-byte master key for secrets at rest.
    pub master_key: Option<String>,

    /// Root directory of the filesystem output adapter.
    pub local_storage_path: Option<String>,

    /// Encoding for stored task outputs.
    pub serializer: Serializer,
}

/// Recognized output serializers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    #[default]
    Json,
    Binary,
}

impl std::str::FromStr for Serializer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            other => anyhow::bail!("FLUX_SERIALIZER must be `json` or `binary`, got `{other}`"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7700,
            database_url: None,
            claim_ack_timeout: Duration::from_secs(10),
            max_claim_attempts: 3,
            orphan_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(15),
            cancel_grace: Duration::from_secs(10),
            scheduler_tick: Duration::from_secs(1),
            dispatcher_tick: Duration::from_secs(2),
            master_key: None,
            local_storage_path: None,
            serializer: Serializer::Json,
        }
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer millisecond value"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: std::env::var("FLUX_HOST").unwrap_or(defaults.host),
            port: match std::env::var("FLUX_PORT") {
                Ok(raw) => raw.parse().context("FLUX_PORT must be a port number")?,
                Err(_) => defaults.port,
            },
            database_url: std::env::var("DATABASE_URL").ok(),
            claim_ack_timeout: env_duration_ms(
                "FLUX_CLAIM_ACK_TIMEOUT_MS",
                defaults.claim_ack_timeout,
            )?,
            max_claim_attempts: match std::env::var("FLUX_MAX_CLAIM_ATTEMPTS") {
                Ok(raw) => raw
                    .parse()
                    .context("FLUX_MAX_CLAIM_ATTEMPTS must be an integer")?,
                Err(_) => defaults.max_claim_attempts,
            },
            orphan_timeout: env_duration_ms("FLUX_ORPHAN_TIMEOUT_MS", defaults.orphan_timeout)?,
            heartbeat_timeout: env_duration_ms(
                "FLUX_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout,
            )?,
            cancel_grace: env_duration_ms("FLUX_CANCEL_GRACE_MS", defaults.cancel_grace)?,
            scheduler_tick: env_duration_ms("FLUX_SCHEDULER_TICK_MS", defaults.scheduler_tick)?,
            dispatcher_tick: env_duration_ms(
                "FLUX_DISPATCHER_TICK_MS",
                defaults.dispatcher_tick,
            )?,
            master_key: std::env::var("FLUX_MASTER_KEY").ok(),
            local_storage_path: std::env::var("FLUX_LOCAL_STORAGE_PATH").ok(),
            serializer: match std::env::var("FLUX_SERIALIZER") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.serializer,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
