//! Workflow trait, execution-scoped context, and the workflow registry
//!
//! A workflow is a compiled object with one entry method, `run(ctx)`. The
//! context threads the event log and runtime services explicitly through
//! every task invocation; there are no hidden globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::TaskCache;
use crate::context::{ExecutionContext, PauseState};
use crate::error::FluxError;
use crate::output::OutputStore;
use crate::resources::ResourceRequest;
use crate::scope::ScopePath;
use crate::secrets::SecretsStore;
use crate::task::{run_task, RuntimeDefaults, TaskFn, TaskOptions};

/// A named, versioned unit of orchestrated work.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique workflow name; the catalog key.
    fn name(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    /// Package names this workflow needs present on a worker.
    fn imports(&self) -> Vec<String> {
        vec![]
    }

    fn resource_request(&self) -> ResourceRequest {
        ResourceRequest::default()
    }

    /// The workflow body. Must be deterministic given the event log: a
    /// replayed run sees recorded task completions and adopts them without
    /// re-executing.
    async fn run(&self, ctx: WorkflowContext) -> Result<Value, FluxError>;
}

/// Services the task runtime draws on, injected at execution time.
#[derive(Default)]
pub struct RuntimeServices {
    pub secrets: Option<Arc<dyn SecretsStore>>,
    pub cache: Option<Arc<dyn TaskCache>>,
    pub output: Option<Arc<dyn OutputStore>>,
}

impl RuntimeServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn TaskCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputStore>) -> Self {
        self.output = Some(output);
        self
    }
}

/// The value threaded through a workflow body: event log access, runtime
/// services, the current scope, and the cancellation token for this branch
/// of the call tree.
#[derive(Clone)]
pub struct WorkflowContext {
    execution: Arc<ExecutionContext>,
    services: Arc<RuntimeServices>,
    defaults: Arc<RuntimeDefaults>,
    scope: ScopePath,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub fn new(
        execution: Arc<ExecutionContext>,
        services: Arc<RuntimeServices>,
        defaults: RuntimeDefaults,
    ) -> Self {
        let scope = execution.root_scope();
        let cancel = execution.cancellation();
        Self {
            execution,
            services,
            defaults: Arc::new(defaults),
            scope,
            cancel,
        }
    }

    pub fn execution(&self) -> &Arc<ExecutionContext> {
        &self.execution
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn defaults(&self) -> &RuntimeDefaults {
        &self.defaults
    }

    pub fn scope(&self) -> &ScopePath {
        &self.scope
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The workflow's input, from the `WorkflowStarted` event.
    pub async fn input(&self) -> Value {
        self.execution
            .snapshot()
            .await
            .input
            .unwrap_or(Value::Null)
    }

    /// A context for a child scope sharing this branch's cancellation.
    pub fn at_scope(&self, scope: ScopePath) -> Self {
        let mut child = self.clone();
        child.scope = scope;
        child
    }

    /// A context for a sibling branch: child scope plus a child token, so
    /// the branch can be cancelled without touching the rest of the tree.
    pub fn branch(&self, scope: ScopePath) -> Self {
        let mut child = self.at_scope(scope);
        child.cancel = self.cancel.child_token();
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), FluxError> {
        if self.is_cancelled() {
            Err(FluxError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Run a task under this scope with default options.
    pub async fn task(&self, name: &str, args: Value, f: TaskFn) -> Result<Value, FluxError> {
        self.task_with(name, args, TaskOptions::default(), f).await
    }

    /// Run a task under this scope with explicit envelope options.
    pub async fn task_with(
        &self,
        name: &str,
        args: Value,
        options: TaskOptions,
        f: TaskFn,
    ) -> Result<Value, FluxError> {
        run_task(self, name, args, options, f).await
    }

    /// Suspend the execution at a named pause point.
    ///
    /// On first encounter this durably records the pause and unwinds the
    /// body with the internal `Paused` kind; after a resume, replay passes
    /// straight through.
    pub async fn pause(&self, name: &str) -> Result<(), FluxError> {
        match self.execution.pause_state(name).await {
            PauseState::Resumed => Ok(()),
            PauseState::Pending => Err(FluxError::paused(name)),
            PauseState::NotPaused => {
                self.execution.record_pause(&self.scope, name).await?;
                Err(FluxError::paused(name))
            }
        }
    }

    /// Cancellation-safe sleep; a suspension point.
    pub async fn sleep(&self, duration: Duration) -> Result<(), FluxError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(FluxError::cancelled()),
        }
    }
}

/// Name-keyed registry of compiled workflows.
///
/// Workers execute only workflows present in their registry; the catalog's
/// source blob is advisory for routing and audit.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<dyn Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workflow: Arc<dyn Workflow>) {
        let name = workflow.name().to_string();
        tracing::info!(workflow = %name, "registered workflow");
        self.workflows.write().insert(name, workflow);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.read().contains_key(name)
    }
}
