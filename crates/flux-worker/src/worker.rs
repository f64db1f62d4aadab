//! The worker loop: register, heartbeat, consume commands, execute
//!
//! Each claimed execution runs as its own task behind a concurrency
//! semaphore. Cancellation is cooperative: a `CANCEL` command appends the
//! durable cancel request to the execution's log, which trips the body's
//! cancellation token at its next suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use flux_core::{
    task::RuntimeDefaults, EventKind, ExecutionContext, FluxError, RuntimeServices,
    WorkflowRegistry, Workflow,
};
use flux_protocol::{RegisterRequest, WorkerCommand, WorkerGateway};

use crate::config::WorkerConfig;
use crate::runner::Runner;

/// A worker process: owns the registry of compiled workflows it can run
/// and a connection to the server.
pub struct Worker {
    config: WorkerConfig,
    gateway: Arc<dyn WorkerGateway>,
    registry: Arc<WorkflowRegistry>,
    services: Arc<RuntimeServices>,
    defaults: RuntimeDefaults,
    active: Arc<DashMap<Uuid, Arc<ExecutionContext>>>,
    draining: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(config: WorkerConfig, gateway: Arc<dyn WorkerGateway>) -> Self {
        Self {
            config,
            gateway,
            registry: Arc::new(WorkflowRegistry::new()),
            services: Arc::new(RuntimeServices::new()),
            defaults: RuntimeDefaults::default(),
            active: Arc::new(DashMap::new()),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Inject runtime services (secrets, cache, output storage).
    pub fn with_services(mut self, services: RuntimeServices) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn with_defaults(mut self, defaults: RuntimeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Register a compiled workflow this worker can execute.
    pub fn register_workflow(&self, workflow: Arc<dyn Workflow>) {
        self.registry.register(workflow);
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Register with the server and process commands until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), FluxError> {
        let ack = self
            .gateway
            .register(RegisterRequest {
                session_name: self.config.session_name.clone(),
                capabilities: self.config.capabilities.clone(),
            })
            .await?;
        info!(worker_id = %ack.worker_id, "registered with server");

        let mut commands = self
            .gateway
            .open_stream(&ack.worker_id, &ack.session_token)
            .await?;

        let runner = Arc::new(Runner::new(
            self.registry.clone(),
            self.services.clone(),
            self.defaults.clone(),
            self.gateway.clone(),
            ack.worker_id.clone(),
            ack.session_token.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_executions));

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.clone(),
            ack.worker_id.clone(),
            ack.session_token.clone(),
            Duration::from_millis(ack.heartbeat_interval_ms.max(100)),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, &runner, &semaphore).await,
                    None => {
                        warn!("command stream closed by server");
                        break;
                    }
                }
            }
        }

        // Graceful exit: wait for in-flight executions, then deregister
        let _permits = semaphore
            .acquire_many(self.config.max_concurrent_executions as u32)
            .await;
        heartbeat.abort();
        if let Err(error) = self
            .gateway
            .deregister(&ack.worker_id, &ack.session_token)
            .await
        {
            warn!(%error, "deregistration failed");
        }
        info!(worker_id = %ack.worker_id, "worker stopped");
        Ok(())
    }

    async fn handle(
        self: &Arc<Self>,
        command: WorkerCommand,
        runner: &Arc<Runner>,
        semaphore: &Arc<Semaphore>,
    ) {
        match command {
            WorkerCommand::Execute(payload) => {
                if self.draining.load(Ordering::SeqCst) {
                    warn!(execution_id = %payload.execution_id, "draining; ignoring assignment");
                    return;
                }
                let worker = self.clone();
                let runner = runner.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let execution_id = payload.execution_id;
                    let execution = runner.context_for(&payload);
                    worker.active.insert(execution_id, execution.clone());

                    if let Err(error) = runner.execute(payload, execution).await {
                        warn!(%execution_id, %error, "execution aborted");
                    }
                    worker.active.remove(&execution_id);
                });
            }
            WorkerCommand::Cancel { execution_id } => {
                self.cancel_execution(execution_id).await;
            }
            WorkerCommand::PauseAck { .. } => {}
            WorkerCommand::Drain => {
                info!("drain requested");
                self.draining.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Make the cancel request durable in the execution's own log; the
    /// append trips the cancellation token, and the body observes it at
    /// its next suspension point.
    async fn cancel_execution(&self, execution_id: Uuid) {
        let Some(execution) = self.active.get(&execution_id).map(|e| e.value().clone()) else {
            // Not running here (already finished or never arrived)
            return;
        };
        let scope = execution.root_scope();
        if let Err(error) = execution
            .event(EventKind::WorkflowCancelRequested, &scope, json!(null))
            .await
        {
            warn!(%execution_id, %error, "failed to record cancel request");
            // Still stop the body; the server will force-reclaim
            execution.cancel();
        }
    }

    async fn heartbeat_loop(
        worker: Arc<Self>,
        worker_id: String,
        session_token: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = worker
                .gateway
                .heartbeat(&worker_id, &session_token, worker.in_flight() as u32)
                .await
            {
                warn!(%error, "heartbeat failed");
            }
        }
    }
}
