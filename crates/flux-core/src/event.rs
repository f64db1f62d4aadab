//! Append-only execution events
//!
//! Events form the authoritative log of an execution. They are used for:
//! - Persisting workflow progress
//! - Replaying executions after crash or reassignment
//! - Auditing and debugging
//!
//! Events are immutable once written. Execution state is reconstructed by
//! replaying all events in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::FluxError;
use crate::scope::ScopePath;

/// The kinds of events an execution can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelRequested,
    WorkflowCancelled,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetryStarted,
    TaskRetryCompleted,
    TaskRetryFailed,
    TaskFallbackStarted,
    TaskFallbackCompleted,
    TaskFallbackFailed,
    TaskRollbackStarted,
    TaskRollbackCompleted,
    TaskRollbackFailed,
    Checkpoint,
}

impl EventKind {
    /// Terminal workflow events end the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }

    /// Events emitted by the task envelope (as opposed to workflow lifecycle).
    pub fn is_task_event(&self) -> bool {
        matches!(
            self,
            Self::TaskStarted
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskRetryStarted
                | Self::TaskRetryCompleted
                | Self::TaskRetryFailed
                | Self::TaskFallbackStarted
                | Self::TaskFallbackCompleted
                | Self::TaskFallbackFailed
                | Self::TaskRollbackStarted
                | Self::TaskRollbackCompleted
                | Self::TaskRollbackFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde encoding so logs and the wire agree
        let s = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        match s {
            Value::String(s) => write!(f, "{s}"),
            _ => Err(std::fmt::Error),
        }
    }
}

/// One immutable record in an execution's log.
///
/// `(execution_id, sequence)` is the primary identifier; `sequence` is dense
/// and monotonic starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub execution_id: Uuid,
    pub sequence: u64,
    pub kind: EventKind,
    /// Scope path of the task or workflow that emitted the event.
    pub source: String,
    pub time: DateTime<Utc>,
    pub value: Value,
}

impl Event {
    pub fn new(
        execution_id: Uuid,
        sequence: u64,
        kind: EventKind,
        source: &ScopePath,
        value: Value,
    ) -> Self {
        Self {
            execution_id,
            sequence,
            kind,
            source: source.to_string(),
            time: Utc::now(),
            value,
        }
    }

    pub fn source_scope(&self) -> ScopePath {
        ScopePath::from(self.source.clone())
    }
}

/// Payload of `TaskStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub args: Value,
    /// Set when the value was served from the task cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

/// Payload of `TaskCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub output: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

/// Payload of `TaskFailed`.
///
/// `terminal` distinguishes the primary failure of the retry chain (a
/// fallback or rollback may still run) from the envelope's final verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub error: FluxError,
    pub terminal: bool,
}

/// Payload of the `TaskRetry*` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPayload {
    /// 1-based attempt number the event refers to.
    pub attempt: u32,
}

/// Payload of `WorkflowPaused`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausePayload {
    pub name: String,
}

/// Payload of `WorkflowFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailedPayload {
    pub error: FluxError,
}

impl Event {
    pub fn task_started(
        execution_id: Uuid,
        sequence: u64,
        scope: &ScopePath,
        args: Value,
        cached: bool,
    ) -> Self {
        Self::new(
            execution_id,
            sequence,
            EventKind::TaskStarted,
            scope,
            json!(TaskStartedPayload { args, cached }),
        )
    }

    pub fn task_completed(
        execution_id: Uuid,
        sequence: u64,
        scope: &ScopePath,
        output: Value,
        cached: bool,
    ) -> Self {
        Self::new(
            execution_id,
            sequence,
            EventKind::TaskCompleted,
            scope,
            json!(TaskCompletedPayload { output, cached }),
        )
    }

    pub fn task_failed(
        execution_id: Uuid,
        sequence: u64,
        scope: &ScopePath,
        error: FluxError,
        terminal: bool,
    ) -> Self {
        Self::new(
            execution_id,
            sequence,
            EventKind::TaskFailed,
            scope,
            json!(TaskFailedPayload { error, terminal }),
        )
    }

    /// Decode the payload as a given type, tolerating nulls as defaults.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, FluxError> {
        serde_json::from_value(self.value.clone()).map_err(FluxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&EventKind::WorkflowCancelRequested).unwrap();
        assert_eq!(json, "\"workflow_cancel_requested\"");
        assert_eq!(EventKind::TaskRetryFailed.to_string(), "task_retry_failed");
    }

    #[test]
    fn test_is_terminal() {
        assert!(EventKind::WorkflowCompleted.is_terminal());
        assert!(EventKind::WorkflowFailed.is_terminal());
        assert!(EventKind::WorkflowCancelled.is_terminal());
        assert!(!EventKind::WorkflowPaused.is_terminal());
        assert!(!EventKind::TaskCompleted.is_terminal());
    }

    #[test]
    fn test_event_round_trip() {
        let scope = ScopePath::root("main").child("upper");
        let event = Event::task_completed(Uuid::now_v7(), 3, &scope, json!("HELLO"), false);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);

        let payload: TaskCompletedPayload = parsed.payload().unwrap();
        assert_eq!(payload.output, json!("HELLO"));
        assert!(!payload.cached);
    }

    #[test]
    fn test_failed_payload_terminal_flag() {
        let scope = ScopePath::root("main").child("flaky");
        let event = Event::task_failed(
            Uuid::now_v7(),
            7,
            &scope,
            FluxError::new(ErrorKind::UserTaskFailure, "boom"),
            true,
        );

        let payload: TaskFailedPayload = event.payload().unwrap();
        assert!(payload.terminal);
        assert_eq!(payload.error.kind, ErrorKind::UserTaskFailure);
    }
}
