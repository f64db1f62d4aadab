//! # Flux Server
//!
//! The coordinator of the orchestration engine:
//!
//! - **Catalog**: versioned workflow registrations
//! - **Worker registry**: capabilities, liveness, session tokens
//! - **Dispatcher**: pairs `scheduled` executions with eligible workers
//! - **Scheduler**: cron/interval-driven execution creation
//! - **Sessions**: the server-pushed command streams and checkpoint intake
//! - **HTTP surface**: admin API and the worker transport (axum + SSE)

pub mod api;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod executions;
pub mod gateway;
pub mod registry;
pub mod scheduler;
pub mod sessions;
pub mod signals;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flux_core::{OutputStore, SecretsStore, TaskCache};
use flux_storage::{
    CatalogStore, EncryptedSecretsStore, EventStore, ExecutionStore, InlineOutputStore,
    MasterKey, MemoryCatalogStore, MemoryEventStore, MemoryExecutionStore,
    MemoryScheduleStore, MemorySecretsBackend, MemoryTaskCache, MemoryWorkerStore,
    PostgresStore, ScheduleStore, StoreError, WorkerStore,
};

use crate::catalog::CatalogService;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::executions::ExecutionService;
use crate::gateway::ServerGateway;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::sessions::SessionManager;
use crate::signals::Signals;

/// The persistence bundle the server runs on.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub workers: Arc<dyn WorkerStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub secrets: Arc<dyn SecretsStore>,
    pub cache: Arc<dyn TaskCache>,
    pub output: Arc<dyn OutputStore>,
}

impl Stores {
    /// Everything in memory; tests and single-process deployments.
    pub fn in_memory(master_key: MasterKey) -> Self {
        Self {
            events: Arc::new(MemoryEventStore::new()),
            executions: Arc::new(MemoryExecutionStore::new()),
            catalog: Arc::new(MemoryCatalogStore::new()),
            workers: Arc::new(MemoryWorkerStore::new()),
            schedules: Arc::new(MemoryScheduleStore::new()),
            secrets: Arc::new(EncryptedSecretsStore::new(
                Arc::new(MemorySecretsBackend::new()),
                master_key,
            )),
            cache: Arc::new(MemoryTaskCache::new()),
            output: Arc::new(InlineOutputStore::new()),
        }
    }

    /// PostgreSQL-backed stores over one pool.
    pub async fn postgres(
        url: &str,
        master_key: MasterKey,
        output: Arc<dyn OutputStore>,
    ) -> Result<Self, StoreError> {
        let store = PostgresStore::connect(url).await?;
        store.ensure_schema().await?;
        let store = Arc::new(store);
        Ok(Self {
            events: store.clone(),
            executions: store.clone(),
            catalog: store.clone(),
            workers: store.clone(),
            schedules: store.clone(),
            secrets: Arc::new(EncryptedSecretsStore::new(store.clone(), master_key)),
            cache: store,
            output,
        })
    }
}

/// The assembled server: services plus background loops.
pub struct FluxServer {
    pub config: ServerConfig,
    pub stores: Stores,
    pub signals: Arc<Signals>,
    pub registry: Arc<WorkerRegistry>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub catalog: Arc<CatalogService>,
    pub executions: Arc<ExecutionService>,
    pub gateway: Arc<ServerGateway>,
}

impl FluxServer {
    pub fn new(config: ServerConfig, stores: Stores) -> Arc<Self> {
        let signals = Arc::new(Signals::new());
        let registry = Arc::new(WorkerRegistry::new(
            stores.workers.clone(),
            config.heartbeat_timeout,
        ));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            stores.events.clone(),
            stores.executions.clone(),
            signals.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            stores.executions.clone(),
            stores.events.clone(),
            stores.catalog.clone(),
            registry.clone(),
            sessions.clone(),
            signals.clone(),
            DispatcherConfig {
                claim_ack_timeout: config.claim_ack_timeout,
                max_claim_attempts: config.max_claim_attempts,
                tick: config.dispatcher_tick,
            },
        ));
        let scheduler = Arc::new(Scheduler::new(
            stores.schedules.clone(),
            stores.executions.clone(),
            stores.catalog.clone(),
            signals.clone(),
            config.scheduler_tick,
        ));
        let catalog = Arc::new(CatalogService::new(stores.catalog.clone()));
        let executions = Arc::new(ExecutionService::new(
            stores.executions.clone(),
            stores.events.clone(),
            stores.catalog.clone(),
            sessions.clone(),
            dispatcher.clone(),
            signals.clone(),
            config.cancel_grace,
        ));
        let gateway = Arc::new(ServerGateway::new(
            registry.clone(),
            sessions.clone(),
            dispatcher.clone(),
            signals.clone(),
        ));

        Arc::new(Self {
            config,
            stores,
            signals,
            registry,
            sessions,
            dispatcher,
            scheduler,
            catalog,
            executions,
            gateway,
        })
    }

    /// Start the dispatcher, scheduler, and liveness reaper. Cancel the
    /// returned token to stop them.
    pub fn spawn_background(self: &Arc<Self>) -> (CancellationToken, Vec<JoinHandle<()>>) {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.dispatcher.clone().run(shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.scheduler.clone().run(shutdown.clone())));
        handles.push(tokio::spawn(Self::reaper_loop(
            Arc::clone(self),
            shutdown.clone(),
        )));

        (shutdown, handles)
    }

    /// Mark silent workers offline and, once the orphan window elapses
    /// without a reconnect, hand their executions back to the dispatcher.
    async fn reaper_loop(server: Arc<Self>, shutdown: CancellationToken) {
        let tick = server.config.heartbeat_timeout / 2;
        let mut offline_since: HashMap<String, Instant> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }

            match server.registry.reap_expired().await {
                Ok(expired) => {
                    for worker_id in expired {
                        server.sessions.disconnect(&worker_id);
                        offline_since.entry(worker_id).or_insert_with(Instant::now);
                    }
                }
                Err(error) => warn!(%error, "liveness reaping failed"),
            }

            let orphan_timeout = server.config.orphan_timeout;
            let mut due = Vec::new();
            offline_since.retain(|worker_id, since| {
                if since.elapsed() >= orphan_timeout {
                    due.push(worker_id.clone());
                    false
                } else {
                    true
                }
            });

            for worker_id in due {
                match server.registry.get(&worker_id).await {
                    // Reconnected in time; it keeps its executions
                    Ok(record) if record.status != flux_storage::WorkerStatus::Offline => {}
                    _ => {
                        info!(%worker_id, "orphan window elapsed, requeueing executions");
                        if let Err(error) = server.dispatcher.requeue_worker(&worker_id).await {
                            warn!(%worker_id, %error, "requeue failed");
                        }
                    }
                }
            }
        }
    }

    /// The axum router over this server's services.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        api::router(api::AppState {
            catalog: self.catalog.clone(),
            executions: self.executions.clone(),
            schedules: self.stores.schedules.clone(),
            secrets: self.stores.secrets.clone(),
            registry: self.registry.clone(),
            gateway: self.gateway.clone(),
            signals: self.signals.clone(),
        })
    }
}
