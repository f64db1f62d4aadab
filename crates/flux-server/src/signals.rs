//! In-process notification fabric
//!
//! Wakes the dispatcher on queue or capacity changes and lets API callers
//! observe execution state transitions and live event streams without
//! polling the stores.

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Notify};
use uuid::Uuid;

use flux_core::{Event, ExecutionState};

const EVENT_STREAM_CAPACITY: usize = 256;

/// Shared signal hub. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct Signals {
    dispatch: Notify,
    states: DashMap<Uuid, watch::Sender<ExecutionState>>,
    events: DashMap<Uuid, broadcast::Sender<Event>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the dispatcher for another matching pass.
    pub fn notify_dispatch(&self) {
        self.dispatch.notify_one();
    }

    pub async fn dispatch_notified(&self) {
        self.dispatch.notified().await;
    }

    /// Record a state transition and wake any observers.
    pub fn set_state(&self, execution_id: Uuid, state: ExecutionState) {
        let sender = self
            .states
            .entry(execution_id)
            .or_insert_with(|| watch::channel(state).0);
        let _ = sender.send(state);
    }

    /// Observe state transitions of one execution.
    pub fn watch_state(
        &self,
        execution_id: Uuid,
        current: ExecutionState,
    ) -> watch::Receiver<ExecutionState> {
        let sender = self
            .states
            .entry(execution_id)
            .or_insert_with(|| watch::channel(current).0);
        sender.subscribe()
    }

    /// Publish newly appended events to live subscribers.
    pub fn publish_events(&self, events: &[Event]) {
        for event in events {
            if let Some(sender) = self.events.get(&event.execution_id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Subscribe to an execution's live event feed.
    pub fn subscribe_events(&self, execution_id: Uuid) -> broadcast::Receiver<Event> {
        self.events
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(EVENT_STREAM_CAPACITY).0)
            .subscribe()
    }

    /// Drop per-execution channels once the execution is terminal and no
    /// subscriber remains.
    pub fn forget(&self, execution_id: Uuid) {
        self.states.remove(&execution_id);
        self.events.remove(&execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_watch() {
        let signals = Signals::new();
        let id = Uuid::now_v7();

        let mut rx = signals.watch_state(id, ExecutionState::Scheduled);
        assert_eq!(*rx.borrow(), ExecutionState::Scheduled);

        signals.set_state(id, ExecutionState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_event_pubsub() {
        let signals = Signals::new();
        let id = Uuid::now_v7();

        let mut rx = signals.subscribe_events(id);
        let event = Event::new(
            id,
            0,
            flux_core::EventKind::WorkflowStarted,
            &flux_core::ScopePath::root("wf"),
            serde_json::json!(null),
        );
        signals.publish_events(std::slice::from_ref(&event));

        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
