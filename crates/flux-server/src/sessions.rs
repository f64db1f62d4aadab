//! Worker sessions: command channels and the checkpoint callback
//!
//! A checkpoint is validated in order: session token, execution assignment,
//! sequence contiguity with the stored log. Accepted events are appended
//! durably, the executions projection is updated from any terminal event,
//! and the acknowledgement carries the highest accepted sequence.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use flux_core::{
    event::WorkflowFailedPayload, Event, EventKind, ExecutionState, FluxError,
};
use flux_protocol::{CheckpointAck, WorkerCommand};
use flux_storage::{EventStore, ExecutionRecord, ExecutionStore};

use crate::registry::WorkerRegistry;
use crate::signals::Signals;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Per-worker command channels plus checkpoint intake.
pub struct SessionManager {
    registry: Arc<WorkerRegistry>,
    events: Arc<dyn EventStore>,
    executions: Arc<dyn ExecutionStore>,
    signals: Arc<Signals>,
    channels: DashMap<String, mpsc::Sender<WorkerCommand>>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        events: Arc<dyn EventStore>,
        executions: Arc<dyn ExecutionStore>,
        signals: Arc<Signals>,
    ) -> Self {
        Self {
            registry,
            events,
            executions,
            signals,
            channels: DashMap::new(),
        }
    }

    /// Open (or replace) the worker's execution stream.
    pub async fn open_stream(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<mpsc::Receiver<WorkerCommand>, FluxError> {
        self.registry.authenticate(worker_id, session_token).await?;
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        if self.channels.insert(worker_id.to_string(), tx).is_some() {
            info!(%worker_id, "replaced existing command stream");
        }
        Ok(rx)
    }

    pub fn is_connected(&self, worker_id: &str) -> bool {
        self.channels
            .get(worker_id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn disconnect(&self, worker_id: &str) {
        self.channels.remove(worker_id);
    }

    /// Push a command onto a worker's stream.
    pub async fn send(&self, worker_id: &str, command: WorkerCommand) -> Result<(), FluxError> {
        let sender = self
            .channels
            .get(worker_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| {
                FluxError::new(
                    flux_core::ErrorKind::WorkerDisconnected,
                    format!("worker {worker_id} has no open stream"),
                )
            })?;
        sender.send(command).await.map_err(|_| {
            FluxError::new(
                flux_core::ErrorKind::WorkerDisconnected,
                format!("worker {worker_id} stream closed"),
            )
        })
    }

    /// Accept a checkpoint from a worker.
    #[instrument(skip(self, session_token, events), fields(count = events.len()))]
    pub async fn checkpoint(
        &self,
        worker_id: &str,
        session_token: &str,
        execution_id: Uuid,
        events: Vec<Event>,
    ) -> Result<CheckpointAck, FluxError> {
        self.registry.authenticate(worker_id, session_token).await?;

        let mut record = self
            .executions
            .get(execution_id)
            .await
            .map_err(FluxError::from)?;
        if record.worker_id.as_deref() != Some(worker_id) {
            return Err(FluxError::conflict(format!(
                "execution {execution_id} is not assigned to {worker_id}"
            )));
        }

        let accepted_sequence = self
            .events
            .append(execution_id, events.clone())
            .await
            .map_err(FluxError::from)?;

        self.project(&mut record, &events).await?;
        self.signals.publish_events(&events);

        // Acknowledge a pause on the command stream, best effort
        if events.iter().any(|e| e.kind == EventKind::WorkflowPaused) {
            let _ = self
                .send(worker_id, WorkerCommand::PauseAck { execution_id })
                .await;
        }

        debug!(%execution_id, accepted_sequence, "checkpoint accepted");
        Ok(CheckpointAck { accepted_sequence })
    }

    /// Fold a batch of accepted events into the executions projection.
    ///
    /// Any accepted checkpoint acknowledges the claim (`Claimed → Running`);
    /// terminal and pause events release the worker and its reservation.
    async fn project(
        &self,
        record: &mut ExecutionRecord,
        events: &[Event],
    ) -> Result<(), FluxError> {
        let mut changed = false;
        let mut released = false;

        if record.state == ExecutionState::Claimed {
            record.state = ExecutionState::Running;
            changed = true;
        }

        for event in events {
            match event.kind {
                EventKind::WorkflowCompleted => {
                    record.state = ExecutionState::Completed;
                    record.output = Some(event.value.clone());
                    record.error = None;
                    released = true;
                    changed = true;
                }
                EventKind::WorkflowFailed => {
                    record.state = ExecutionState::Failed;
                    record.error = event
                        .payload::<WorkflowFailedPayload>()
                        .map(|p| p.error)
                        .ok();
                    released = true;
                    changed = true;
                }
                EventKind::WorkflowCancelled => {
                    record.state = ExecutionState::Cancelled;
                    released = true;
                    changed = true;
                }
                EventKind::WorkflowPaused => {
                    record.state = ExecutionState::Paused;
                    released = true;
                    changed = true;
                }
                EventKind::WorkflowCancelRequested => {
                    if !record.state.is_terminal() {
                        record.state = ExecutionState::Cancelling;
                        changed = true;
                    }
                }
                _ => {}
            }
        }

        if released {
            record.worker_id = None;
            self.registry.release(record.execution_id);
            // Capacity freed; let the dispatcher look again
            self.signals.notify_dispatch();
        }
        if changed {
            self.executions
                .update(record)
                .await
                .map_err(FluxError::from)?;
            self.signals.set_state(record.execution_id, record.state);
        }
        Ok(())
    }
}
