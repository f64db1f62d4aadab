//! The durable task runtime
//!
//! Every task invocation runs inside an envelope implementing the
//! retry → fallback → rollback chain, a per-attempt timeout, and an
//! optional cache lookup. Composition primitives (`parallel`, `pipeline`,
//! `map`, `graph`) are built on top of the envelope.

mod compose;
mod envelope;
mod graph;
mod policy;

pub use compose::{branch, map, parallel, pipeline, Branch};
pub use envelope::run_task;
pub use graph::{Graph, GraphBuilder};
pub use policy::{CachePolicy, RetryPolicy, RuntimeDefaults, TaskOptions};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::FluxError;

/// What a task body receives: its arguments plus any resolved secrets.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub args: Value,
    pub secrets: HashMap<String, String>,
}

impl TaskInput {
    pub fn new(args: Value) -> Self {
        Self {
            args,
            secrets: HashMap::new(),
        }
    }
}

/// Boxed future returned by task bodies and handlers.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, FluxError>> + Send>>;

/// A task body.
pub type TaskFn = Arc<dyn Fn(TaskInput) -> TaskFuture + Send + Sync>;

/// A fallback handler: original input plus the terminal error of the
/// primary chain.
pub type FallbackFn = Arc<dyn Fn(TaskInput, FluxError) -> TaskFuture + Send + Sync>;

/// A rollback handler: original input; outcome recorded, never propagated.
pub type RollbackFn = Arc<dyn Fn(TaskInput) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FluxError>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Wrap an async closure as a [`FallbackFn`].
pub fn fallback_fn<F, Fut>(f: F) -> FallbackFn
where
    F: Fn(TaskInput, FluxError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FluxError>> + Send + 'static,
{
    Arc::new(move |input, error| Box::pin(f(input, error)))
}

/// Wrap an async closure as a [`RollbackFn`].
pub fn rollback_fn<F, Fut>(f: F) -> RollbackFn
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FluxError>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}
