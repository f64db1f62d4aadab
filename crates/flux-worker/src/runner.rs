//! Executes one assignment: replay, drive the body, checkpoint everything
//!
//! The runner rebuilds the execution context from the prior events in the
//! `EXECUTE` command and drives the workflow from its local registry. Every
//! event the body produces flows through the checkpoint sink, which ships
//! it to the server and waits for the acknowledgement before the body makes
//! further progress — the durability contract of the event log.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use flux_core::{
    event::WorkflowFailedPayload,
    task::RuntimeDefaults,
    ErrorKind, Event, EventKind, EventSink, ExecutionContext, FluxError, RuntimeServices,
    WorkflowContext, WorkflowRegistry,
};
use flux_protocol::{ExecutePayload, WorkerGateway};

/// Sink that ships every append as a checkpoint and awaits the ack.
pub struct CheckpointSink {
    gateway: Arc<dyn WorkerGateway>,
    worker_id: String,
    session_token: String,
    execution_id: Uuid,
}

impl CheckpointSink {
    pub fn new(
        gateway: Arc<dyn WorkerGateway>,
        worker_id: String,
        session_token: String,
        execution_id: Uuid,
    ) -> Self {
        Self {
            gateway,
            worker_id,
            session_token,
            execution_id,
        }
    }
}

#[async_trait]
impl EventSink for CheckpointSink {
    async fn append(&self, events: Vec<Event>) -> Result<u64, FluxError> {
        let ack = self
            .gateway
            .checkpoint(
                &self.worker_id,
                &self.session_token,
                self.execution_id,
                events,
            )
            .await?;
        Ok(ack.accepted_sequence)
    }
}

/// Drives workflow bodies on behalf of one worker session.
pub struct Runner {
    registry: Arc<WorkflowRegistry>,
    services: Arc<RuntimeServices>,
    defaults: RuntimeDefaults,
    gateway: Arc<dyn WorkerGateway>,
    worker_id: String,
    session_token: String,
}

impl Runner {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        services: Arc<RuntimeServices>,
        defaults: RuntimeDefaults,
        gateway: Arc<dyn WorkerGateway>,
        worker_id: String,
        session_token: String,
    ) -> Self {
        Self {
            registry,
            services,
            defaults,
            gateway,
            worker_id,
            session_token,
        }
    }

    /// Build the replayable context for an assignment.
    pub fn context_for(&self, payload: &ExecutePayload) -> Arc<ExecutionContext> {
        let sink = Arc::new(CheckpointSink::new(
            self.gateway.clone(),
            self.worker_id.clone(),
            self.session_token.clone(),
            payload.execution_id,
        ));
        Arc::new(ExecutionContext::with_history(
            payload.execution_id,
            payload.workflow_name.clone(),
            sink,
            payload.prior_events.clone(),
        ))
    }

    /// Run one assignment to its next stopping point: completion, failure,
    /// pause, or cancellation acknowledgement.
    #[instrument(skip(self, payload, execution), fields(execution_id = %payload.execution_id, workflow = %payload.workflow_name))]
    pub async fn execute(
        &self,
        payload: ExecutePayload,
        execution: Arc<ExecutionContext>,
    ) -> Result<(), FluxError> {
        let scope = execution.root_scope();

        let Some(workflow) = self.registry.get(&payload.workflow_name) else {
            warn!("workflow not in local registry");
            let error = FluxError::not_found(format!(
                "workflow `{}` is not registered on this worker",
                payload.workflow_name
            ));
            execution
                .event(
                    EventKind::WorkflowFailed,
                    &scope,
                    json!(WorkflowFailedPayload { error }),
                )
                .await?;
            return Ok(());
        };

        execution.start(payload.input.clone()).await?;
        if execution.is_finished().await {
            // Reassigned after the terminal event was already durable
            return Ok(());
        }

        let ctx = WorkflowContext::new(
            execution.clone(),
            self.services.clone(),
            self.defaults.clone(),
        );

        match workflow.run(ctx).await {
            Ok(output) => {
                if !execution.is_finished().await {
                    execution
                        .event(EventKind::WorkflowCompleted, &scope, output)
                        .await?;
                }
                info!("workflow completed");
            }
            Err(error) if error.kind == ErrorKind::Paused => {
                // WorkflowPaused is already durable; the server re-queues
                // on resume.
                info!(pause = %error.message, "workflow paused");
            }
            Err(error) if error.kind == ErrorKind::Cancelled => {
                if !execution.was_cancelled().await {
                    execution
                        .event(EventKind::WorkflowCancelled, &scope, json!(null))
                        .await?;
                }
                info!("workflow cancelled");
            }
            Err(error) => {
                warn!(%error, "workflow failed");
                if !execution.is_finished().await {
                    execution
                        .event(
                            EventKind::WorkflowFailed,
                            &scope,
                            json!(WorkflowFailedPayload { error }),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}
