//! Execution state machine and event-log projection

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FluxError;
use crate::event::{Event, EventKind, PausePayload, WorkflowFailedPayload};

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Queued, waiting for the dispatcher to find a worker
    Scheduled,

    /// Assigned to a worker, awaiting acknowledgement
    Claimed,

    /// A worker is driving the workflow body
    Running,

    /// Suspended at an explicit pause point
    Paused,

    /// Cancellation requested, awaiting the worker's acknowledgement
    Cancelling,

    /// Cancellation acknowledged (terminal)
    Cancelled,

    /// Finished successfully (terminal)
    Completed,

    /// Finished with an unhandled error (terminal)
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions of the execution state machine.
    ///
    /// Cancellation may be requested from any non-terminal state; everything
    /// else follows the claim/start/pause/resume progression.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Scheduled, Claimed) => true,
            (Claimed, Running) => true,
            // Claim acknowledgement timed out, back to the queue
            (Claimed, Scheduled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Paused) => true,
            (Paused, Scheduled) | (Paused, Running) => true,
            // Worker lost mid-flight, execution re-queued
            (Running, Scheduled) => true,
            (s, Cancelling) if !s.is_terminal() => true,
            (Cancelling, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Claimed => write!(f, "claimed"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State derived deterministically from an execution's full event list.
///
/// Claim assignment is not evented (it lives in the executions projection),
/// so a snapshot only distinguishes the states the log itself encodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub state: ExecutionState,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<FluxError>,
    /// Name of the pause point currently holding the execution, if paused.
    pub pause_name: Option<String>,
    /// A durable `WorkflowCancelRequested` is in the log.
    pub cancel_requested: bool,
    pub next_sequence: u64,
}

impl ExecutionSnapshot {
    /// Replay events from sequence 0 into a snapshot.
    pub fn replay(events: &[Event]) -> Self {
        let mut snapshot = Self {
            state: ExecutionState::Scheduled,
            input: None,
            output: None,
            error: None,
            pause_name: None,
            cancel_requested: false,
            next_sequence: 0,
        };

        for event in events {
            snapshot.next_sequence = event.sequence + 1;
            match event.kind {
                EventKind::WorkflowStarted => {
                    snapshot.state = ExecutionState::Running;
                    snapshot.input = Some(event.value.clone());
                }
                EventKind::WorkflowCompleted => {
                    snapshot.state = ExecutionState::Completed;
                    snapshot.output = Some(event.value.clone());
                }
                EventKind::WorkflowFailed => {
                    snapshot.state = ExecutionState::Failed;
                    snapshot.error = event
                        .payload::<WorkflowFailedPayload>()
                        .map(|p| p.error)
                        .ok();
                }
                EventKind::WorkflowPaused => {
                    snapshot.state = ExecutionState::Paused;
                    snapshot.pause_name =
                        event.payload::<PausePayload>().map(|p| p.name).ok();
                }
                EventKind::WorkflowResumed => {
                    snapshot.state = ExecutionState::Running;
                    snapshot.pause_name = None;
                }
                EventKind::WorkflowCancelRequested => {
                    snapshot.cancel_requested = true;
                    if !snapshot.state.is_terminal() {
                        snapshot.state = ExecutionState::Cancelling;
                    }
                }
                EventKind::WorkflowCancelled => {
                    snapshot.state = ExecutionState::Cancelled;
                }
                _ => {}
            }
        }

        snapshot
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopePath;
    use serde_json::json;
    use uuid::Uuid;

    fn ev(seq: u64, kind: EventKind, value: Value) -> Event {
        Event::new(Uuid::nil(), seq, kind, &ScopePath::root("main"), value)
    }

    #[test]
    fn test_transitions() {
        use ExecutionState::*;
        assert!(Scheduled.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Claimed.can_transition_to(Scheduled));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Scheduled));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Cancelling));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Scheduled.can_transition_to(Running));
    }

    #[test]
    fn test_replay_completed() {
        let events = vec![
            ev(0, EventKind::WorkflowStarted, json!("hello")),
            ev(1, EventKind::WorkflowCompleted, json!("HELLO")),
        ];

        let snapshot = ExecutionSnapshot::replay(&events);
        assert_eq!(snapshot.state, ExecutionState::Completed);
        assert_eq!(snapshot.output, Some(json!("HELLO")));
        assert_eq!(snapshot.next_sequence, 2);
        assert!(snapshot.is_finished());
    }

    #[test]
    fn test_replay_pause_resume() {
        let mut events = vec![
            ev(0, EventKind::WorkflowStarted, json!(null)),
            ev(1, EventKind::WorkflowPaused, json!({"name": "approve"})),
        ];

        let paused = ExecutionSnapshot::replay(&events);
        assert_eq!(paused.state, ExecutionState::Paused);
        assert_eq!(paused.pause_name.as_deref(), Some("approve"));

        events.push(ev(2, EventKind::WorkflowResumed, json!(null)));
        let resumed = ExecutionSnapshot::replay(&events);
        assert_eq!(resumed.state, ExecutionState::Running);
        assert!(resumed.pause_name.is_none());
    }

    #[test]
    fn test_replay_cancellation() {
        let events = vec![
            ev(0, EventKind::WorkflowStarted, json!(null)),
            ev(1, EventKind::WorkflowCancelRequested, json!(null)),
            ev(2, EventKind::WorkflowCancelled, json!(null)),
        ];

        let snapshot = ExecutionSnapshot::replay(&events);
        assert_eq!(snapshot.state, ExecutionState::Cancelled);
        assert!(snapshot.cancel_requested);
        assert!(snapshot.output.is_none());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events = vec![
            ev(0, EventKind::WorkflowStarted, json!({"n": 1})),
            ev(1, EventKind::TaskStarted, json!({"args": {}})),
            ev(2, EventKind::TaskCompleted, json!({"output": 42})),
            ev(3, EventKind::WorkflowCompleted, json!(42)),
        ];

        let a = ExecutionSnapshot::replay(&events);
        let b = ExecutionSnapshot::replay(&events);
        assert_eq!(a, b);
    }
}
