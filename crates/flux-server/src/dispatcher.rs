//! Dispatcher: pairs pending executions with eligible workers
//!
//! Matching rule: a worker is eligible iff its free cpu and memory cover
//! the request, its packages and tags are supersets, and it is not
//! draining. Among eligible workers the one with the most free capacity
//! wins, ties broken by oldest `last_seen`; among competing executions,
//! priority then FIFO over `created_at`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use flux_core::{
    event::WorkflowFailedPayload, ErrorKind, Event, EventKind, ExecutionState, FluxError,
    ResourceRequest, ScopePath,
};
use flux_protocol::{ExecutePayload, WorkerCommand};
use flux_storage::{CatalogStore, EventStore, ExecutionRecord, ExecutionStore};

use crate::registry::{EligibleWorker, WorkerRegistry};
use crate::sessions::SessionManager;
use crate::signals::Signals;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub claim_ack_timeout: Duration,
    pub max_claim_attempts: u32,
    pub tick: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            claim_ack_timeout: Duration::from_secs(10),
            max_claim_attempts: 3,
            tick: Duration::from_secs(2),
        }
    }
}

pub struct Dispatcher {
    executions: Arc<dyn ExecutionStore>,
    events: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogStore>,
    registry: Arc<WorkerRegistry>,
    sessions: Arc<SessionManager>,
    signals: Arc<Signals>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        events: Arc<dyn EventStore>,
        catalog: Arc<dyn CatalogStore>,
        registry: Arc<WorkerRegistry>,
        sessions: Arc<SessionManager>,
        signals: Arc<Signals>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            executions,
            events,
            catalog,
            registry,
            sessions,
            signals,
            config,
        }
    }

    /// Matching loop: wakes on queue/capacity changes and on a periodic
    /// tick as a backstop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.signals.dispatch_notified() => {}
                _ = tokio::time::sleep(self.config.tick) => {}
            }
            if let Err(error) = self.pass().await {
                warn!(%error, "dispatch pass failed");
            }
        }
        info!("dispatcher stopped");
    }

    /// One matching pass over the ready queue.
    #[instrument(skip(self))]
    pub async fn pass(self: &Arc<Self>) -> Result<(), FluxError> {
        let mut pending = self
            .executions
            .list_in_state(ExecutionState::Scheduled)
            .await
            .map_err(FluxError::from)?;
        if pending.is_empty() {
            return Ok(());
        }
        // Priority first, then FIFO over created_at
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        for execution in pending {
            let request = self.resource_request(&execution).await;
            let workers = self.registry.eligible().await?;
            let Some(best) = pick_worker(&workers, &request, |id| {
                self.sessions.is_connected(id)
            }) else {
                // Backpressure: stays Scheduled until capacity appears
                debug!(execution_id = %execution.execution_id, "no eligible worker");
                continue;
            };
            self.assign(&execution, &best, request).await?;
        }
        Ok(())
    }

    async fn resource_request(&self, execution: &ExecutionRecord) -> ResourceRequest {
        self.catalog
            .get_version(&execution.workflow_name, execution.workflow_version)
            .await
            .map(|entry| entry.resource_request)
            .unwrap_or_default()
    }

    /// Atomically claim and hand the execution to the worker.
    async fn assign(
        self: &Arc<Self>,
        execution: &ExecutionRecord,
        worker: &EligibleWorker,
        request: ResourceRequest,
    ) -> Result<(), FluxError> {
        let execution_id = execution.execution_id;
        let worker_id = worker.record.worker_id.clone();

        let claimed = self
            .executions
            .transition(
                execution_id,
                ExecutionState::Scheduled,
                ExecutionState::Claimed,
                Some(&worker_id),
            )
            .await
            .map_err(FluxError::from)?;
        if !claimed {
            // Someone else moved it first
            return Ok(());
        }
        self.registry.reserve(&worker_id, execution_id, request);
        self.signals.set_state(execution_id, ExecutionState::Claimed);

        let prior_events = self
            .events
            .load(execution_id)
            .await
            .map_err(FluxError::from)?;
        let source = self
            .catalog
            .get_version(&execution.workflow_name, execution.workflow_version)
            .await
            .map(|entry| entry.source)
            .unwrap_or_default();

        let command = WorkerCommand::Execute(ExecutePayload {
            execution_id,
            workflow_name: execution.workflow_name.clone(),
            workflow_version: execution.workflow_version,
            source,
            input: execution.input.clone(),
            prior_events,
        });

        match self.sessions.send(&worker_id, command).await {
            Ok(()) => {
                info!(%execution_id, %worker_id, "execution assigned");
                self.spawn_claim_watchdog(execution_id, worker_id);
                Ok(())
            }
            Err(error) => {
                warn!(%execution_id, %worker_id, %error, "assignment delivery failed");
                self.revert_claim(execution_id, &worker_id).await
            }
        }
    }

    /// Revert a claim that was never acknowledged; after too many attempts
    /// the execution fails with `no_worker_available`.
    async fn revert_claim(&self, execution_id: Uuid, worker_id: &str) -> Result<(), FluxError> {
        let mut record = self
            .executions
            .get(execution_id)
            .await
            .map_err(FluxError::from)?;
        if record.state != ExecutionState::Claimed
            || record.worker_id.as_deref() != Some(worker_id)
        {
            // The worker acknowledged (or someone else took over) meanwhile
            return Ok(());
        }

        self.registry.release(execution_id);
        record.attempts += 1;
        if record.attempts >= self.config.max_claim_attempts {
            return self.fail_unassignable(record).await;
        }

        record.state = ExecutionState::Scheduled;
        record.worker_id = None;
        self.executions
            .update(&record)
            .await
            .map_err(FluxError::from)?;
        self.signals.set_state(execution_id, ExecutionState::Scheduled);
        self.signals.notify_dispatch();
        Ok(())
    }

    /// Terminal `no_worker_available` failure, recorded in the log.
    async fn fail_unassignable(&self, mut record: ExecutionRecord) -> Result<(), FluxError> {
        let error = FluxError::new(
            ErrorKind::NoWorkerAvailable,
            format!(
                "no worker acknowledged after {} attempts",
                record.attempts
            ),
        );
        let sequence = self
            .events
            .next_sequence(record.execution_id)
            .await
            .map_err(FluxError::from)?;
        let event = Event::new(
            record.execution_id,
            sequence,
            EventKind::WorkflowFailed,
            &ScopePath::root(&record.workflow_name),
            json!(WorkflowFailedPayload {
                error: error.clone()
            }),
        );
        self.events
            .append(record.execution_id, vec![event.clone()])
            .await
            .map_err(FluxError::from)?;

        record.state = ExecutionState::Failed;
        record.error = Some(error);
        record.worker_id = None;
        self.executions
            .update(&record)
            .await
            .map_err(FluxError::from)?;
        self.signals.publish_events(&[event]);
        self.signals.set_state(record.execution_id, ExecutionState::Failed);
        warn!(execution_id = %record.execution_id, "execution failed: no worker available");
        Ok(())
    }

    fn spawn_claim_watchdog(self: &Arc<Self>, execution_id: Uuid, worker_id: String) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.config.claim_ack_timeout).await;
            if let Err(error) = dispatcher.revert_claim(execution_id, &worker_id).await {
                warn!(%execution_id, %error, "claim watchdog failed");
            }
        });
    }

    /// Requeue everything a lost worker was running. Cancelling executions
    /// are finalized directly (the owner is gone, the server owns the log).
    pub async fn requeue_worker(&self, worker_id: &str) -> Result<(), FluxError> {
        let in_flight = self
            .executions
            .list_for_worker(worker_id)
            .await
            .map_err(FluxError::from)?;

        for mut record in in_flight {
            match record.state {
                ExecutionState::Claimed | ExecutionState::Running => {
                    info!(execution_id = %record.execution_id, %worker_id, "requeueing orphaned execution");
                    self.registry.release(record.execution_id);
                    record.state = ExecutionState::Scheduled;
                    record.worker_id = None;
                    record.attempts += 1;
                    self.executions
                        .update(&record)
                        .await
                        .map_err(FluxError::from)?;
                    self.signals
                        .set_state(record.execution_id, ExecutionState::Scheduled);
                }
                ExecutionState::Cancelling => {
                    self.registry.release(record.execution_id);
                    self.finalize_cancel(&mut record).await?;
                }
                _ => {}
            }
        }
        self.signals.notify_dispatch();
        Ok(())
    }

    /// Server-side cancellation commit, used when no worker can acknowledge.
    pub async fn finalize_cancel(&self, record: &mut ExecutionRecord) -> Result<(), FluxError> {
        let scope = ScopePath::root(&record.workflow_name);
        let mut sequence = self
            .events
            .next_sequence(record.execution_id)
            .await
            .map_err(FluxError::from)?;

        let stored = self
            .events
            .load(record.execution_id)
            .await
            .map_err(FluxError::from)?;
        let mut batch = Vec::new();
        if !stored
            .iter()
            .any(|e| e.kind == EventKind::WorkflowCancelRequested)
        {
            batch.push(Event::new(
                record.execution_id,
                sequence,
                EventKind::WorkflowCancelRequested,
                &scope,
                json!(null),
            ));
            sequence += 1;
        }
        batch.push(Event::new(
            record.execution_id,
            sequence,
            EventKind::WorkflowCancelled,
            &scope,
            json!(null),
        ));
        self.events
            .append(record.execution_id, batch.clone())
            .await
            .map_err(FluxError::from)?;

        record.state = ExecutionState::Cancelled;
        record.worker_id = None;
        self.executions
            .update(record)
            .await
            .map_err(FluxError::from)?;
        self.signals.publish_events(&batch);
        self.signals
            .set_state(record.execution_id, ExecutionState::Cancelled);
        Ok(())
    }
}

/// Best fit among eligible workers: most free capacity, ties broken by
/// oldest `last_seen`.
fn pick_worker<F>(
    workers: &[EligibleWorker],
    request: &ResourceRequest,
    is_connected: F,
) -> Option<EligibleWorker>
where
    F: Fn(&str) -> bool,
{
    workers
        .iter()
        .filter(|w| w.free.satisfies(request) && is_connected(&w.record.worker_id))
        .max_by(|a, b| {
            a.free
                .free_score()
                .partial_cmp(&b.free.free_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                // Older last_seen wins a tie, so it must compare greater
                .then(b.record.last_seen.cmp(&a.record.last_seen))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flux_core::WorkerCapabilities;
    use flux_storage::{WorkerRecord, WorkerStatus};

    fn worker(id: &str, cpu: f64, packages: &[&str], seen_offset_s: i64) -> EligibleWorker {
        let capabilities = WorkerCapabilities {
            cpu,
            packages: packages.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        EligibleWorker {
            record: WorkerRecord {
                worker_id: id.to_string(),
                session_name: id.to_string(),
                capabilities: capabilities.clone(),
                status: WorkerStatus::Online,
                session_token: "t".to_string(),
                last_seen: Utc::now() - chrono::Duration::seconds(seen_offset_s),
                registered_at: Utc::now(),
            },
            free: capabilities,
            in_flight: 0,
        }
    }

    #[test]
    fn test_matching_by_resources_and_packages() {
        let workers = vec![worker("w1", 4.0, &["a"], 0), worker("w2", 2.0, &["a", "b"], 0)];

        let e1 = ResourceRequest::new().with_cpu(3.0).with_packages(["a"]);
        let e2 = ResourceRequest::new().with_cpu(1.0).with_packages(["b"]);

        let pick1 = pick_worker(&workers, &e1, |_| true).unwrap();
        assert_eq!(pick1.record.worker_id, "w1");

        let pick2 = pick_worker(&workers, &e2, |_| true).unwrap();
        assert_eq!(pick2.record.worker_id, "w2");
    }

    #[test]
    fn test_best_fit_prefers_most_free() {
        let workers = vec![worker("small", 2.0, &[], 0), worker("big", 8.0, &[], 0)];
        let request = ResourceRequest::new().with_cpu(1.0);

        let pick = pick_worker(&workers, &request, |_| true).unwrap();
        assert_eq!(pick.record.worker_id, "big");
    }

    #[test]
    fn test_tie_broken_by_oldest_last_seen() {
        let workers = vec![worker("fresh", 4.0, &[], 0), worker("stale", 4.0, &[], 60)];
        let request = ResourceRequest::new().with_cpu(1.0);

        let pick = pick_worker(&workers, &request, |_| true).unwrap();
        assert_eq!(pick.record.worker_id, "stale");
    }

    #[test]
    fn test_disconnected_workers_skipped() {
        let workers = vec![worker("w1", 4.0, &[], 0)];
        let request = ResourceRequest::new();

        assert!(pick_worker(&workers, &request, |_| false).is_none());
    }
}
