//! Worker configuration from environment variables

use anyhow::{Context, Result};

use flux_core::WorkerCapabilities;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    /// Human-readable session name advertised at registration.
    pub session_name: String,
    pub max_concurrent_executions: usize,
    pub capabilities: WorkerCapabilities,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:7700".to_string(),
            session_name: "flux-worker".to_string(),
            max_concurrent_executions: 10,
            capabilities: WorkerCapabilities::default(),
        }
    }
}

fn env_set(name: &str) -> std::collections::BTreeSet<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_concurrent_executions = match std::env::var("FLUX_MAX_CONCURRENT_EXECUTIONS") {
            Ok(raw) => raw
                .parse()
                .context("FLUX_MAX_CONCURRENT_EXECUTIONS must be an integer")?,
            Err(_) => defaults.max_concurrent_executions,
        };

        let mut capabilities = WorkerCapabilities {
            max_concurrent: max_concurrent_executions as u32,
            ..Default::default()
        };
        if let Ok(raw) = std::env::var("FLUX_WORKER_CPU") {
            capabilities.cpu = raw.parse().context("FLUX_WORKER_CPU must be a number")?;
        }
        if let Ok(raw) = std::env::var("FLUX_WORKER_MEMORY_MB") {
            let mb: u64 = raw
                .parse()
                .context("FLUX_WORKER_MEMORY_MB must be an integer")?;
            capabilities.memory_bytes = mb * 1024 * 1024;
        }
        capabilities.packages = env_set("FLUX_WORKER_PACKAGES");
        capabilities.tags = env_set("FLUX_WORKER_TAGS");

        Ok(Self {
            server_url: std::env::var("FLUX_SERVER_URL").unwrap_or(defaults.server_url),
            session_name: std::env::var("FLUX_SESSION_NAME").unwrap_or(defaults.session_name),
            max_concurrent_executions,
            capabilities,
        })
    }
}
