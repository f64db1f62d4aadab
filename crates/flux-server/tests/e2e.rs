//! End-to-end scenarios: server + workers over the in-process gateway
//!
//! These tests exercise the full path — enqueue, dispatch, claim, execute,
//! checkpoint, project — against in-memory stores with aggressive timers.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flux_core::prelude::*;
use flux_core::task;
use flux_protocol::{CheckpointAck, RegisterAck, RegisterRequest, WorkerCommand, WorkerGateway};
use flux_server::config::ServerConfig;
use flux_server::{FluxServer, Stores};
use flux_storage::{generate_master_key, MasterKey, ScheduleRecord, ScheduleTrigger};
use flux_worker::{Worker, WorkerConfig};

fn fast_config() -> ServerConfig {
    ServerConfig {
        claim_ack_timeout: Duration::from_millis(500),
        max_claim_attempts: 3,
        orphan_timeout: Duration::from_millis(300),
        heartbeat_timeout: Duration::from_millis(200),
        cancel_grace: Duration::from_secs(2),
        scheduler_tick: Duration::from_millis(100),
        dispatcher_tick: Duration::from_millis(100),
        ..ServerConfig::default()
    }
}

struct Harness {
    server: Arc<FluxServer>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn harness() -> Harness {
    let key = MasterKey::from_base64(&generate_master_key()).expect("fresh key");
    let server = FluxServer::new(fast_config(), Stores::in_memory(key));
    let (shutdown, _handles) = server.spawn_background();
    Harness { server, shutdown }
}

async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Spawn a worker wired straight to the server gateway, running the given
/// workflows with the server's own runtime services.
async fn spawn_worker(
    harness: &Harness,
    capabilities: WorkerCapabilities,
    workflows: Vec<Arc<dyn Workflow>>,
) -> CancellationToken {
    let services = RuntimeServices::new()
        .with_secrets(harness.server.stores.secrets.clone())
        .with_cache(harness.server.stores.cache.clone())
        .with_output(harness.server.stores.output.clone());

    let config = WorkerConfig {
        session_name: format!("test-{}", Uuid::now_v7()),
        max_concurrent_executions: 8,
        capabilities,
        ..Default::default()
    };
    let worker = Arc::new(
        Worker::new(config, harness.server.gateway.clone()).with_services(services),
    );
    for workflow in workflows {
        worker.register_workflow(workflow);
    }

    let before = harness.server.registry.list().await.expect("registry").len();
    let token = CancellationToken::new();
    tokio::spawn(worker.run(token.clone()));

    let registry = harness.server.registry.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let registry = registry.clone();
            async move { registry.list().await.map(|w| w.len() > before).unwrap_or(false) }
        })
        .await,
        "worker never registered"
    );
    token
}

async fn register_in_catalog(harness: &Harness, name: &str, request: ResourceRequest) {
    harness
        .server
        .catalog
        .register(name, name.as_bytes().to_vec(), BTreeSet::new(), request)
        .await
        .expect("catalog registration");
}

fn upper_task() -> flux_core::task::TaskFn {
    task::task_fn(|input| async move {
        Ok(json!(input
            .args
            .as_str()
            .unwrap_or_default()
            .to_uppercase()))
    })
}

fn kinds_of(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

// =========================================================================
// Workflows under test
// =========================================================================

struct Echo;

#[async_trait]
impl Workflow for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let input = ctx.input().await;
        ctx.task("upper", input, upper_task()).await
    }
}

struct Flaky {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let attempts = self.attempts.clone();
        ctx.task_with(
            "flaky",
            json!(null),
            TaskOptions::new().with_retry(RetryPolicy::new(3)),
            task::task_fn(move |_| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(FluxError::user("transient failure"))
                    } else {
                        Ok(json!("recovered"))
                    }
                }
            }),
        )
        .await
    }
}

struct FanOut;

#[async_trait]
impl Workflow for FanOut {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let items = match ctx.input().await {
            Value::Array(items) => items,
            other => vec![other],
        };
        let results = task::map(&ctx, "upper", items, TaskOptions::default(), upper_task()).await?;
        Ok(Value::Array(results))
    }
}

struct Approval;

#[async_trait]
impl Workflow for Approval {
    fn name(&self) -> &str {
        "approval"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        ctx.pause("approve").await?;
        Ok(json!("done"))
    }
}

struct Sleeper;

#[async_trait]
impl Workflow for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        ctx.task(
            "sleep",
            json!(null),
            task::task_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            }),
        )
        .await
    }
}

struct Timed;

#[async_trait]
impl Workflow for Timed {
    fn name(&self) -> &str {
        "timed"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        ctx.task_with(
            "slow",
            json!(null),
            TaskOptions::new().with_timeout(Duration::from_millis(300)),
            task::task_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(1))
            }),
        )
        .await
    }
}

struct Cached {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for Cached {
    fn name(&self) -> &str {
        "cached"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let calls = self.calls.clone();
        ctx.task_with(
            "compute",
            ctx.input().await,
            TaskOptions::new().with_cache(CachePolicy::default()),
            task::task_fn(move |input| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(format!(
                        "computed:{}",
                        input.args.as_str().unwrap_or_default()
                    )))
                }
            }),
        )
        .await
    }
}

struct Secretive {
    ran: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for Secretive {
    fn name(&self) -> &str {
        "secretive"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let ran = self.ran.clone();
        ctx.task_with(
            "needs-secrets",
            json!(null),
            TaskOptions::new().with_secrets(["A", "B"]),
            task::task_fn(move |_| {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .await
    }
}

/// Records which worker label executed it.
struct Probe {
    workflow: String,
    label: String,
    seen: Arc<parking_lot::Mutex<std::collections::HashMap<String, String>>>,
}

#[async_trait]
impl Workflow for Probe {
    fn name(&self) -> &str {
        &self.workflow
    }

    async fn run(&self, _ctx: WorkflowContext) -> Result<Value, FluxError> {
        self.seen
            .lock()
            .insert(self.workflow.clone(), self.label.clone());
        Ok(json!(self.label))
    }
}

struct TwoStep {
    step1_calls: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow for TwoStep {
    fn name(&self) -> &str {
        "twostep"
    }

    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError> {
        let calls = self.step1_calls.clone();
        let one = ctx
            .task(
                "step1",
                json!(null),
                task::task_fn(move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("one"))
                    }
                }),
            )
            .await?;
        let two = ctx
            .task(
                "step2",
                json!(null),
                task::task_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(json!("two"))
                }),
            )
            .await?;
        Ok(json!([one, two]))
    }
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn echo_workflow_completes_with_expected_events() {
    let h = harness();
    register_in_catalog(&h, "echo", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Echo)]).await;

    let record = h.server.executions.run("echo", json!("hello"), 0).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!("HELLO")));

    let events = h.server.executions.events(record.execution_id).await.unwrap();
    assert_eq!(
        kinds_of(&events),
        vec![
            EventKind::WorkflowStarted,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
            EventKind::WorkflowCompleted,
        ]
    );
    assert_eq!(events[1].source, "echo.upper");

    // Replaying the log from sequence 0 reconstructs the terminal state
    let snapshot = ExecutionSnapshot::replay(&events);
    assert_eq!(snapshot.state, ExecutionState::Completed);
    assert_eq!(snapshot.output, Some(json!("HELLO")));
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn retry_then_succeed_emits_one_retry_pair() {
    let h = harness();
    register_in_catalog(&h, "flaky", ResourceRequest::default()).await;
    let attempts = Arc::new(AtomicU32::new(0));
    let _worker = spawn_worker(
        &h,
        WorkerCapabilities::default(),
        vec![Arc::new(Flaky {
            attempts: attempts.clone(),
        })],
    )
    .await;

    let record = h.server.executions.run("flaky", json!(null), 0).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!("recovered")));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let events = h.server.executions.events(record.execution_id).await.unwrap();
    let kinds = kinds_of(&events);
    let retry_started = kinds
        .iter()
        .filter(|k| **k == EventKind::TaskRetryStarted)
        .count();
    let retry_completed = kinds
        .iter()
        .filter(|k| **k == EventKind::TaskRetryCompleted)
        .count();
    assert_eq!((retry_started, retry_completed), (1, 1));
    // The successful retry closes its pair; nothing failed within it
    assert!(!kinds.contains(&EventKind::TaskRetryFailed));

    let retry_started_at = kinds
        .iter()
        .position(|k| *k == EventKind::TaskRetryStarted)
        .unwrap();
    let retry_completed_at = kinds
        .iter()
        .position(|k| *k == EventKind::TaskRetryCompleted)
        .unwrap();
    let completed_at = kinds
        .iter()
        .position(|k| *k == EventKind::TaskCompleted)
        .unwrap();
    assert!(retry_started_at < retry_completed_at);
    assert!(retry_completed_at < completed_at);
}

#[tokio::test]
async fn parallel_fan_out_preserves_input_order() {
    let h = harness();
    register_in_catalog(&h, "fanout", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(FanOut)]).await;

    let record = h
        .server
        .executions
        .run("fanout", json!(["a", "b", "c"]), 0)
        .await
        .unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!(["A", "B", "C"])));

    // Sibling scopes are distinct on the sequence axis
    let events = h.server.executions.events(record.execution_id).await.unwrap();
    let sources: BTreeSet<String> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskCompleted)
        .map(|e| e.source.clone())
        .collect();
    assert_eq!(
        sources,
        ["fanout.upper[0]", "fanout.upper[1]", "fanout.upper[2]"]
            .into_iter()
            .map(String::from)
            .collect()
    );
}

#[tokio::test]
async fn pause_then_resume_completes_with_single_pause_pair() {
    let h = harness();
    register_in_catalog(&h, "approval", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Approval)]).await;

    let record = h
        .server
        .executions
        .run("approval", json!(null), 0)
        .await
        .unwrap();
    let executions = h.server.executions.clone();
    let id = record.execution_id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            let executions = executions.clone();
            async move {
                executions
                    .get(id)
                    .await
                    .map(|r| r.state == ExecutionState::Paused)
                    .unwrap_or(false)
            }
        })
        .await,
        "never paused"
    );

    h.server.executions.resume(id).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!("done")));

    let events = h.server.executions.events(id).await.unwrap();
    let kinds = kinds_of(&events);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::WorkflowPaused)
            .count(),
        1
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::WorkflowResumed)
            .count(),
        1
    );
}

#[tokio::test]
async fn resume_of_non_paused_execution_is_conflict() {
    let h = harness();
    register_in_catalog(&h, "echo", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Echo)]).await;

    let record = h.server.executions.run("echo", json!("x"), 0).await.unwrap();
    h.server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let error = h
        .server
        .executions
        .resume(record.execution_id)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Conflict);
}

#[tokio::test]
async fn cancel_reaches_sleeping_task_quickly() {
    let h = harness();
    register_in_catalog(&h, "sleeper", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Sleeper)]).await;

    let record = h.server.executions.run("sleeper", json!(null), 0).await.unwrap();
    let id = record.execution_id;
    let executions = h.server.executions.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let executions = executions.clone();
            async move {
                executions
                    .get(id)
                    .await
                    .map(|r| r.state == ExecutionState::Running)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let started = Instant::now();
    h.server.executions.cancel(id, false).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(id, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));

    let events = h.server.executions.events(id).await.unwrap();
    let kinds = kinds_of(&events);
    assert!(kinds.contains(&EventKind::WorkflowCancelRequested));
    assert!(kinds.contains(&EventKind::WorkflowCancelled));
    assert!(!kinds.contains(&EventKind::TaskCompleted));
}

#[tokio::test]
async fn cancel_of_terminal_execution_is_noop() {
    let h = harness();
    register_in_catalog(&h, "echo", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Echo)]).await;

    let record = h.server.executions.run("echo", json!("x"), 0).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(finished.state, ExecutionState::Completed);

    let after = h
        .server
        .executions
        .cancel(record.execution_id, true)
        .await
        .unwrap();
    assert_eq!(after.state, ExecutionState::Completed);
    assert_eq!(after.output, Some(json!("X")));
}

#[tokio::test]
async fn task_timeout_fails_within_budget() {
    let h = harness();
    register_in_catalog(&h, "timed", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Timed)]).await;

    let started = Instant::now();
    let record = h.server.executions.run("timed", json!(null), 0).await.unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Failed);
    let error = finished.error.expect("error payload");
    assert_eq!(error.kind, ErrorKind::Timeout);
    // Well under the 10s the body wanted to sleep
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn dispatcher_matches_resources_and_packages() {
    let h = harness();
    let seen = Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new()));

    let w1_caps = WorkerCapabilities {
        cpu: 4.0,
        packages: ["a".to_string()].into(),
        ..Default::default()
    };
    let w2_caps = WorkerCapabilities {
        cpu: 2.0,
        packages: ["a".to_string(), "b".to_string()].into(),
        ..Default::default()
    };

    let probe = |wf: &str, label: &str| -> Arc<dyn Workflow> {
        Arc::new(Probe {
            workflow: wf.to_string(),
            label: label.to_string(),
            seen: seen.clone(),
        })
    };
    let _w1 = spawn_worker(&h, w1_caps, vec![probe("e1", "w1"), probe("e2", "w1")]).await;
    let _w2 = spawn_worker(&h, w2_caps, vec![probe("e1", "w2"), probe("e2", "w2")]).await;

    register_in_catalog(
        &h,
        "e1",
        ResourceRequest::new().with_cpu(3.0).with_packages(["a"]),
    )
    .await;
    register_in_catalog(
        &h,
        "e2",
        ResourceRequest::new().with_cpu(1.0).with_packages(["b"]),
    )
    .await;

    let r1 = h.server.executions.run("e1", json!(null), 0).await.unwrap();
    let r2 = h.server.executions.run("e2", json!(null), 0).await.unwrap();
    for id in [r1.execution_id, r2.execution_id] {
        let finished = h
            .server
            .executions
            .wait_terminal(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(finished.state, ExecutionState::Completed);
    }

    let seen = seen.lock();
    assert_eq!(seen.get("e1").map(String::as_str), Some("w1"));
    assert_eq!(seen.get("e2").map(String::as_str), Some("w2"));
}

#[tokio::test]
async fn unsatisfiable_execution_stays_scheduled() {
    let h = harness();
    register_in_catalog(
        &h,
        "echo",
        ResourceRequest::new().with_cpu(64.0),
    )
    .await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Echo)]).await;

    let record = h.server.executions.run("echo", json!("x"), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let current = h.server.executions.get(record.execution_id).await.unwrap();
    assert_eq!(current.state, ExecutionState::Scheduled);
}

#[tokio::test]
async fn concurrent_claims_cannot_double_assign() {
    let h = harness();
    register_in_catalog(&h, "echo", ResourceRequest::default()).await;

    let record = flux_storage::ExecutionRecord::new("echo", 1, json!(null));
    let id = record.execution_id;
    h.server.stores.executions.create(record).await.unwrap();

    let store = h.server.stores.executions.clone();
    let (a, b) = tokio::join!(
        store.transition(
            id,
            ExecutionState::Scheduled,
            ExecutionState::Claimed,
            Some("worker-a"),
        ),
        store.transition(
            id,
            ExecutionState::Scheduled,
            ExecutionState::Claimed,
            Some("worker-b"),
        ),
    );

    let outcomes = (a.unwrap(), b.unwrap());
    assert!(outcomes.0 ^ outcomes.1, "exactly one claim must win");
}

/// Gateway wrapper with a kill switch: once dead, the worker can no longer
/// heartbeat or checkpoint, as if the process vanished.
struct Killable {
    inner: Arc<dyn WorkerGateway>,
    dead: Arc<std::sync::atomic::AtomicBool>,
}

impl Killable {
    fn check(&self) -> Result<(), FluxError> {
        if self.dead.load(Ordering::SeqCst) {
            Err(FluxError::new(
                ErrorKind::WorkerDisconnected,
                "simulated crash",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkerGateway for Killable {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, FluxError> {
        self.inner.register(request).await
    }

    async fn open_stream(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<WorkerCommand>, FluxError> {
        self.inner.open_stream(worker_id, session_token).await
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        session_token: &str,
        in_flight: u32,
    ) -> Result<(), FluxError> {
        self.check()?;
        self.inner.heartbeat(worker_id, session_token, in_flight).await
    }

    async fn checkpoint(
        &self,
        worker_id: &str,
        session_token: &str,
        execution_id: Uuid,
        events: Vec<Event>,
    ) -> Result<CheckpointAck, FluxError> {
        self.check()?;
        self.inner
            .checkpoint(worker_id, session_token, execution_id, events)
            .await
    }

    async fn drain(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.check()?;
        self.inner.drain(worker_id, session_token).await
    }

    async fn deregister(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.check()?;
        self.inner.deregister(worker_id, session_token).await
    }
}

#[tokio::test]
async fn dead_worker_execution_is_reassigned_and_resumes_from_log() {
    let h = harness();
    register_in_catalog(&h, "twostep", ResourceRequest::default()).await;
    let step1_calls = Arc::new(AtomicU32::new(0));

    // Worker 1 behind a killable gateway
    let dead = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let killable: Arc<dyn WorkerGateway> = Arc::new(Killable {
        inner: h.server.gateway.clone(),
        dead: dead.clone(),
    });
    let w1 = Arc::new(
        Worker::new(
            WorkerConfig {
                session_name: "doomed".to_string(),
                ..Default::default()
            },
            killable,
        )
        .with_services(RuntimeServices::new()),
    );
    w1.register_workflow(Arc::new(TwoStep {
        step1_calls: step1_calls.clone(),
    }));
    let w1_token = CancellationToken::new();
    tokio::spawn(w1.run(w1_token.clone()));
    let registry = h.server.registry.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let registry = registry.clone();
            async move { registry.list().await.map(|w| !w.is_empty()).unwrap_or(false) }
        })
        .await
    );

    let record = h
        .server
        .executions
        .run("twostep", json!(null), 0)
        .await
        .unwrap();
    let id = record.execution_id;

    // Wait until step1 is durable, then crash worker 1 mid step2
    let events_store = h.server.stores.events.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let events_store = events_store.clone();
            async move {
                events_store
                    .load(id)
                    .await
                    .map(|events| {
                        events
                            .iter()
                            .any(|e| e.kind == EventKind::TaskCompleted && e.source == "twostep.step1")
                    })
                    .unwrap_or(false)
            }
        })
        .await,
        "step1 never checkpointed"
    );
    dead.store(true, Ordering::SeqCst);

    // A healthy worker joins; the orphaned execution must land on it and
    // resume from the recorded log without re-running step1.
    let _w2 = spawn_worker(
        &h,
        WorkerCapabilities::default(),
        vec![Arc::new(TwoStep {
            step1_calls: step1_calls.clone(),
        })],
    )
    .await;

    let finished = h
        .server
        .executions
        .wait_terminal(id, Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!(["one", "two"])));
    assert_eq!(
        step1_calls.load(Ordering::SeqCst),
        1,
        "step1 must replay, not re-run"
    );
    assert!(finished.attempts >= 1, "reassignment bumped the attempt counter");
}

#[tokio::test]
async fn schedule_fires_and_execution_completes() {
    let h = harness();
    register_in_catalog(&h, "echo", ResourceRequest::default()).await;
    let _worker = spawn_worker(&h, WorkerCapabilities::default(), vec![Arc::new(Echo)]).await;

    let mut schedule = ScheduleRecord::new(
        "echo",
        ScheduleTrigger::Interval { period_ms: 60_000 },
    );
    schedule.input_template = json!("tick");
    schedule.next_fire_at = Some(chrono::Utc::now() - chrono::Duration::milliseconds(50));
    let schedule_id = schedule.schedule_id;
    h.server.stores.schedules.create(schedule).await.unwrap();

    let executions = h.server.stores.executions.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let executions = executions.clone();
            async move {
                executions
                    .list_in_state(ExecutionState::Completed)
                    .await
                    .map(|records| {
                        records
                            .iter()
                            .any(|r| r.schedule_id == Some(schedule_id) && r.output == Some(json!("TICK")))
                    })
                    .unwrap_or(false)
            }
        })
        .await,
        "scheduled execution never completed"
    );

    let stored = h.server.stores.schedules.get(schedule_id).await.unwrap();
    assert!(stored.last_fired_at.is_some());
    assert!(stored.next_fire_at.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn missing_secret_fails_before_task_starts() {
    let h = harness();
    register_in_catalog(&h, "secretive", ResourceRequest::default()).await;
    h.server.stores.secrets.put("A", "present").await.unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let _worker = spawn_worker(
        &h,
        WorkerCapabilities::default(),
        vec![Arc::new(Secretive { ran: ran.clone() })],
    )
    .await;

    let record = h
        .server
        .executions
        .run("secretive", json!(null), 0)
        .await
        .unwrap();
    let finished = h
        .server
        .executions
        .wait_terminal(record.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(finished.state, ExecutionState::Failed);
    assert_eq!(finished.error.unwrap().kind, ErrorKind::SecretMissing);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let events = h.server.executions.events(record.execution_id).await.unwrap();
    assert!(!kinds_of(&events).contains(&EventKind::TaskStarted));
}

#[tokio::test]
async fn cache_hit_skips_body_on_second_execution() {
    let h = harness();
    register_in_catalog(&h, "cached", ResourceRequest::default()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let _worker = spawn_worker(
        &h,
        WorkerCapabilities::default(),
        vec![Arc::new(Cached {
            calls: calls.clone(),
        })],
    )
    .await;

    let first = h
        .server
        .executions
        .run("cached", json!("day-1"), 0)
        .await
        .unwrap();
    let first = h
        .server
        .executions
        .wait_terminal(first.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(first.output, Some(json!("computed:day-1")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = h
        .server
        .executions
        .run("cached", json!("day-1"), 0)
        .await
        .unwrap();
    let second_finished = h
        .server
        .executions
        .wait_terminal(second.execution_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(second_finished.output, Some(json!("computed:day-1")));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "body must not run again");

    let events = h
        .server
        .executions
        .events(second.execution_id)
        .await
        .unwrap();
    assert_eq!(
        kinds_of(&events),
        vec![
            EventKind::WorkflowStarted,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
            EventKind::WorkflowCompleted,
        ]
    );
}
