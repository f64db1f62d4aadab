//! Composition primitives built on the task envelope
//!
//! Structured concurrency: a scope owns its children, cancellation of the
//! parent cascades, a child failure cancels siblings and is re-raised by
//! the scope. Sibling events may interleave on the sequence axis but each
//! sibling's internal order is preserved.

use std::future::Future;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{TaskFn, TaskFuture, TaskOptions};
use crate::error::FluxError;
use crate::workflow::WorkflowContext;

/// One branch of a `parallel` block.
pub type Branch = Box<dyn FnOnce(WorkflowContext) -> TaskFuture + Send>;

/// Wrap an async closure as a [`Branch`].
pub fn branch<F, Fut>(f: F) -> Branch
where
    F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, FluxError>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Launch all branches concurrently under distinct indexed scopes.
///
/// Completes when all branches complete, with results in declaration
/// order. A single branch failure cancels the siblings and the first
/// terminal error is rethrown.
pub async fn parallel(
    ctx: &WorkflowContext,
    name: &str,
    branches: Vec<Branch>,
) -> Result<Vec<Value>, FluxError> {
    ctx.check_cancelled()?;

    let mut set = JoinSet::new();
    let mut tokens: Vec<CancellationToken> = Vec::with_capacity(branches.len());

    for (index, branch) in branches.into_iter().enumerate() {
        let child = ctx.branch(ctx.scope().indexed(name, index));
        tokens.push(child.cancellation().clone());
        set.spawn(async move { (index, branch(child).await) });
    }

    collect_ordered(set, tokens, "parallel").await
}

/// Apply one task over enumerated items, preserving input order in the
/// results regardless of completion order. Concurrency is unbounded.
pub async fn map(
    ctx: &WorkflowContext,
    name: &str,
    items: Vec<Value>,
    options: TaskOptions,
    f: TaskFn,
) -> Result<Vec<Value>, FluxError> {
    ctx.check_cancelled()?;

    // Branches keep the parent scope; the indexed task name separates the
    // sibling event streams (`parent.name[i]`).
    let mut set = JoinSet::new();
    let mut tokens: Vec<CancellationToken> = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let child = ctx.branch(ctx.scope().clone());
        tokens.push(child.cancellation().clone());
        let f = f.clone();
        let options = options.clone();
        let task_name = format!("{name}[{index}]");
        set.spawn(async move {
            (index, child.task_with(&task_name, item, options, f).await)
        });
    }

    collect_ordered(set, tokens, "map").await
}

/// Drain a join set, cancelling siblings on the first real failure and
/// keeping results in spawn order.
async fn collect_ordered(
    mut set: JoinSet<(usize, Result<Value, FluxError>)>,
    tokens: Vec<CancellationToken>,
    primitive: &str,
) -> Result<Vec<Value>, FluxError> {
    let mut results: Vec<Option<Value>> = (0..tokens.len()).map(|_| None).collect();
    let mut first_error: Option<FluxError> = None;

    while let Some(joined) = set.join_next().await {
        let (index, result) = joined.map_err(|e| {
            FluxError::internal(format!("{primitive} branch panicked: {e}"))
        })?;
        match result {
            Ok(value) => results[index] = Some(value),
            Err(error) => {
                // Cancelled siblings are a consequence, not the cause
                if first_error.is_none() && !error.is_cancelled() {
                    for token in &tokens {
                        token.cancel();
                    }
                }
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(results.into_iter().flatten().collect()),
    }
}

/// Run stages sequentially; the output of each stage is the input of the
/// next. Returns the last stage's output.
pub async fn pipeline(
    ctx: &WorkflowContext,
    name: &str,
    stages: Vec<(String, TaskFn)>,
    input: Value,
) -> Result<Value, FluxError> {
    let scoped = ctx.at_scope(ctx.scope().child(name));
    let mut current = input;
    for (stage_name, f) in stages {
        current = scoped.task(&stage_name, current, f).await?;
    }
    Ok(current)
}
