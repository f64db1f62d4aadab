//! Execution service: run, status, resume, cancel
//!
//! The cancel path is cooperative: while a worker owns the execution the
//! server flips the projection to `Cancelling` and pushes a `CANCEL`
//! command; the worker records the cancellation events through its own
//! checkpoint stream. Only unowned executions (and grace-period overruns)
//! are finalized server-side, preserving the single-writer discipline on
//! the event log.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use flux_core::{Event, EventKind, ExecutionState, FluxError, ScopePath};
use flux_protocol::WorkerCommand;
use flux_storage::{CatalogStore, EventStore, ExecutionRecord, ExecutionStore};

use crate::dispatcher::Dispatcher;
use crate::sessions::SessionManager;
use crate::signals::Signals;

pub struct ExecutionService {
    executions: Arc<dyn ExecutionStore>,
    events: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogStore>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    signals: Arc<Signals>,
    cancel_grace: Duration,
}

impl ExecutionService {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        events: Arc<dyn EventStore>,
        catalog: Arc<dyn CatalogStore>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        signals: Arc<Signals>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            executions,
            events,
            catalog,
            sessions,
            dispatcher,
            signals,
            cancel_grace,
        }
    }

    /// Enqueue a new execution of the latest registered version.
    pub async fn run(
        &self,
        workflow_name: &str,
        input: Value,
        priority: i32,
    ) -> Result<ExecutionRecord, FluxError> {
        let entry = self
            .catalog
            .get_latest(workflow_name)
            .await
            .map_err(FluxError::from)?;

        let record =
            ExecutionRecord::new(entry.name, entry.version, input).with_priority(priority);
        self.executions
            .create(record.clone())
            .await
            .map_err(FluxError::from)?;

        info!(execution_id = %record.execution_id, workflow = %record.workflow_name, "execution enqueued");
        self.signals
            .set_state(record.execution_id, ExecutionState::Scheduled);
        self.signals.notify_dispatch();
        Ok(record)
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<ExecutionRecord, FluxError> {
        self.executions
            .get(execution_id)
            .await
            .map_err(FluxError::from)
    }

    pub async fn events(&self, execution_id: Uuid) -> Result<Vec<Event>, FluxError> {
        self.events
            .load(execution_id)
            .await
            .map_err(FluxError::from)
    }

    /// Live event feed plus the stored prefix, for `stream` consumers.
    pub async fn stream_events(
        &self,
        execution_id: Uuid,
    ) -> Result<(Vec<Event>, broadcast::Receiver<Event>), FluxError> {
        // Subscribe first so nothing published between load and subscribe
        // is lost; consumers dedupe by sequence.
        let rx = self.signals.subscribe_events(execution_id);
        let stored = self.events(execution_id).await?;
        Ok((stored, rx))
    }

    /// Block until the execution reaches a terminal state.
    pub async fn wait_terminal(
        &self,
        execution_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<ExecutionRecord, FluxError> {
        let record = self.get(execution_id).await?;
        if record.state.is_terminal() {
            return Ok(record);
        }

        let mut rx = self.signals.watch_state(execution_id, record.state);
        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                FluxError::timeout(format!(
                    "execution {execution_id} still running after {limit:?}"
                ))
            })?,
            None => wait.await,
        }

        self.get(execution_id).await
    }

    /// Resume a paused execution: record `WorkflowResumed` and put it back
    /// in the dispatch queue.
    pub async fn resume(&self, execution_id: Uuid) -> Result<ExecutionRecord, FluxError> {
        let mut record = self.get(execution_id).await?;
        if record.state != ExecutionState::Paused {
            return Err(FluxError::conflict(format!(
                "resume requires a paused execution, {execution_id} is {}",
                record.state
            )));
        }

        let sequence = self
            .events
            .next_sequence(execution_id)
            .await
            .map_err(FluxError::from)?;
        let event = Event::new(
            execution_id,
            sequence,
            EventKind::WorkflowResumed,
            &ScopePath::root(&record.workflow_name),
            json!(null),
        );
        self.events
            .append(execution_id, vec![event.clone()])
            .await
            .map_err(FluxError::from)?;

        record.state = ExecutionState::Scheduled;
        record.worker_id = None;
        self.executions
            .update(&record)
            .await
            .map_err(FluxError::from)?;

        info!(%execution_id, "execution resumed");
        self.signals.publish_events(&[event]);
        self.signals.set_state(execution_id, ExecutionState::Scheduled);
        self.signals.notify_dispatch();
        Ok(record)
    }

    /// Request cancellation. A terminal execution is a no-op returning the
    /// current record; `sync` waits for the terminal state.
    pub async fn cancel(
        self: &Arc<Self>,
        execution_id: Uuid,
        sync: bool,
    ) -> Result<ExecutionRecord, FluxError> {
        let mut record = self.get(execution_id).await?;
        if record.state.is_terminal() {
            return Ok(record);
        }

        match record.worker_id.clone() {
            None => {
                // Scheduled or paused: nothing is writing the log, commit
                // the cancellation directly.
                self.dispatcher.finalize_cancel(&mut record).await?;
            }
            Some(worker_id) => {
                if record.state != ExecutionState::Cancelling {
                    record.state = ExecutionState::Cancelling;
                    self.executions
                        .update(&record)
                        .await
                        .map_err(FluxError::from)?;
                    self.signals
                        .set_state(execution_id, ExecutionState::Cancelling);
                }

                if let Err(error) = self
                    .sessions
                    .send(&worker_id, WorkerCommand::Cancel { execution_id })
                    .await
                {
                    // The owner is unreachable; reclaim immediately
                    warn!(%execution_id, %worker_id, %error, "cancel delivery failed, finalizing");
                    self.dispatcher.finalize_cancel(&mut record).await?;
                } else {
                    self.spawn_cancel_watchdog(execution_id);
                }
            }
        }

        if sync {
            return self.wait_terminal(execution_id, None).await;
        }
        self.get(execution_id).await
    }

    /// Force-reclaim if the worker does not acknowledge within the grace
    /// period. Clearing the assignment makes late checkpoints rejectable.
    fn spawn_cancel_watchdog(self: &Arc<Self>, execution_id: Uuid) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(service.cancel_grace).await;
            let Ok(mut record) = service.get(execution_id).await else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            warn!(%execution_id, "cancellation grace period elapsed, force-reclaiming");
            if let Err(error) = service.dispatcher.finalize_cancel(&mut record).await {
                warn!(%execution_id, %error, "forced cancellation failed");
            }
        });
    }
}
