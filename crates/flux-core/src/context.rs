//! Execution context: the live, in-memory projection of one event log
//!
//! Every state change goes through [`ExecutionContext::event`], which assigns
//! the next sequence number under a single-writer lock and persists through
//! the [`EventSink`] before returning. A sink implementation MUST make the
//! events durable before `append` resolves; a crash before that leaves the
//! execution in its previous state and replay from the durable log is
//! authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::FluxError;
use crate::event::{
    Event, EventKind, PausePayload, TaskCompletedPayload, TaskFailedPayload,
};
use crate::scope::ScopePath;
use crate::state::ExecutionSnapshot;

/// Durable destination for newly produced events.
///
/// The server appends straight to the event store; a worker ships a
/// checkpoint batch and awaits the server's acknowledgement.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist events durably. Returns the next expected sequence.
    async fn append(&self, events: Vec<Event>) -> Result<u64, FluxError>;
}

/// An [`EventSink`] that buffers events in memory.
///
/// Used by tests and by callers that persist the log themselves after the
/// fact. "Durable" here means the buffer push has happened.
#[derive(Default)]
pub struct BufferSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for BufferSink {
    async fn append(&self, events: Vec<Event>) -> Result<u64, FluxError> {
        let mut buffer = self.events.lock();
        buffer.extend(events);
        Ok(buffer.last().map(|e| e.sequence + 1).unwrap_or(0))
    }
}

struct LogState {
    events: Vec<Event>,
    next_sequence: u64,
}

/// How a pause point relates to the current log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    /// No pause with this name recorded yet
    NotPaused,
    /// Paused and later resumed; replay should pass through
    Resumed,
    /// Paused with no resume yet
    Pending,
}

/// The event-sourced state machine of a single workflow execution.
pub struct ExecutionContext {
    execution_id: Uuid,
    workflow_name: String,
    log: Mutex<LogState>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_history(execution_id, workflow_name, sink, vec![])
    }

    /// Rebuild a context from the durable log, for mid-execution replay.
    pub fn with_history(
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        sink: Arc<dyn EventSink>,
        prior_events: Vec<Event>,
    ) -> Self {
        let next_sequence = prior_events.last().map(|e| e.sequence + 1).unwrap_or(0);
        let cancel = CancellationToken::new();
        if prior_events
            .iter()
            .any(|e| e.kind == EventKind::WorkflowCancelRequested)
        {
            cancel.cancel();
        }
        Self {
            execution_id,
            workflow_name: workflow_name.into(),
            log: Mutex::new(LogState {
                events: prior_events,
                next_sequence,
            }),
            sink,
            cancel,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn root_scope(&self) -> ScopePath {
        ScopePath::root(&self.workflow_name)
    }

    /// Append `WorkflowStarted` unless the log already has one.
    pub async fn start(&self, input: Value) -> Result<(), FluxError> {
        {
            let log = self.log.lock().await;
            if log
                .events
                .iter()
                .any(|e| e.kind == EventKind::WorkflowStarted)
            {
                return Ok(());
            }
        }
        self.event(EventKind::WorkflowStarted, &self.root_scope(), input)
            .await?;
        Ok(())
    }

    /// Append one event and persist it before returning (the checkpoint
    /// contract). Sequence assignment and the sink call happen under the
    /// same lock, keeping the log single-writer.
    pub async fn event(
        &self,
        kind: EventKind,
        source: &ScopePath,
        value: Value,
    ) -> Result<Event, FluxError> {
        let mut events = self
            .event_batch(vec![(kind, source.clone(), value)])
            .await?;
        Ok(events.remove(0))
    }

    /// Append several events as one durable batch (a single checkpoint).
    ///
    /// Used where the events only make sense together, e.g. the pause pair.
    pub async fn event_batch(
        &self,
        items: Vec<(EventKind, ScopePath, Value)>,
    ) -> Result<Vec<Event>, FluxError> {
        if items.is_empty() {
            return Ok(vec![]);
        }
        let mut log = self.log.lock().await;
        let mut batch = Vec::with_capacity(items.len());
        for (offset, (kind, source, value)) in items.iter().enumerate() {
            batch.push(Event::new(
                self.execution_id,
                log.next_sequence + offset as u64,
                *kind,
                source,
                value.clone(),
            ));
        }
        self.sink.append(batch.clone()).await?;
        log.next_sequence += batch.len() as u64;
        log.events.extend(batch.iter().cloned());
        drop(log);

        if items
            .iter()
            .any(|(kind, _, _)| *kind == EventKind::WorkflowCancelRequested)
        {
            self.cancel.cancel();
        }
        Ok(batch)
    }

    /// State derived from the full event list.
    pub async fn snapshot(&self) -> ExecutionSnapshot {
        let log = self.log.lock().await;
        ExecutionSnapshot::replay(&log.events)
    }

    pub async fn events(&self) -> Vec<Event> {
        self.log.lock().await.events.clone()
    }

    /// Request cooperative cancellation of the running body.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn is_finished(&self) -> bool {
        self.snapshot().await.is_finished()
    }

    pub async fn is_succeeded(&self) -> bool {
        self.snapshot().await.state == crate::state::ExecutionState::Completed
    }

    pub async fn is_failed(&self) -> bool {
        self.snapshot().await.state == crate::state::ExecutionState::Failed
    }

    pub async fn is_paused(&self) -> bool {
        self.snapshot().await.state == crate::state::ExecutionState::Paused
    }

    pub async fn was_cancelled(&self) -> bool {
        self.snapshot().await.state == crate::state::ExecutionState::Cancelled
    }

    /// Replay lookup: the recorded completion of a task scope, if any.
    pub async fn find_task_completed(
        &self,
        scope: &ScopePath,
    ) -> Option<TaskCompletedPayload> {
        let log = self.log.lock().await;
        log.events
            .iter()
            .filter(|e| e.kind == EventKind::TaskCompleted && e.source == scope.as_str())
            .next_back()
            .and_then(|e| e.payload::<TaskCompletedPayload>().ok())
    }

    /// Replay lookup: the recorded terminal failure of a task scope, if any.
    pub async fn find_task_terminal_failure(&self, scope: &ScopePath) -> Option<FluxError> {
        let log = self.log.lock().await;
        log.events
            .iter()
            .filter(|e| e.kind == EventKind::TaskFailed && e.source == scope.as_str())
            .filter_map(|e| e.payload::<TaskFailedPayload>().ok())
            .filter(|p| p.terminal)
            .next_back()
            .map(|p| p.error)
    }

    /// Where a named pause point stands in the log.
    pub async fn pause_state(&self, name: &str) -> PauseState {
        let log = self.log.lock().await;
        let mut state = PauseState::NotPaused;
        for event in &log.events {
            match event.kind {
                EventKind::WorkflowPaused => {
                    if event
                        .payload::<PausePayload>()
                        .map(|p| p.name == name)
                        .unwrap_or(false)
                    {
                        state = PauseState::Pending;
                    }
                }
                EventKind::WorkflowResumed => {
                    if state == PauseState::Pending {
                        state = PauseState::Resumed;
                    }
                }
                _ => {}
            }
        }
        state
    }

    /// Emit the pause pair: `WorkflowPaused` plus a `Checkpoint` carrying an
    /// opaque continuation marker, durable as one batch.
    pub async fn record_pause(&self, scope: &ScopePath, name: &str) -> Result<(), FluxError> {
        self.event_batch(vec![
            (
                EventKind::WorkflowPaused,
                scope.clone(),
                json!(PausePayload {
                    name: name.to_string()
                }),
            ),
            (
                EventKind::Checkpoint,
                scope.clone(),
                json!({ "pause": name, "scope": scope.to_string() }),
            ),
        ])
        .await?;
        Ok(())
    }
}
