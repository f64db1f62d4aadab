//! The durable envelope around every task invocation
//!
//! Handler ordering is retry → fallback → rollback; each outer layer sees
//! the inner layer's final result. The envelope emits events at each
//! boundary so replay skips the work, and it yields to cancellation between
//! attempts and between layers.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{TaskFn, TaskInput, TaskOptions};
use crate::error::{ErrorKind, FluxError};
use crate::event::{Event, EventKind, RetryPayload, TaskFailedPayload};
use crate::fingerprint::task_fingerprint;
use crate::output::{resolve_value, OutputReference};
use crate::scope::ScopePath;
use crate::workflow::WorkflowContext;

/// Execute one task invocation under the durable envelope.
///
/// The scope is `ctx.scope().child(name)`; replay, cache, secrets, retries,
/// fallback, rollback, and output offload all happen here.
pub async fn run_task(
    ctx: &WorkflowContext,
    name: &str,
    args: Value,
    options: TaskOptions,
    f: TaskFn,
) -> Result<Value, FluxError> {
    let scope = ctx.scope().child(name);
    let execution = ctx.execution().clone();

    // Replay rule: adopt a recorded outcome without re-executing.
    if let Some(completed) = execution.find_task_completed(&scope).await {
        debug!(scope = %scope, "replaying recorded task completion");
        let output_store = ctx.services().output.as_deref();
        return resolve_value(completed.output, output_store).await;
    }
    if let Some(error) = execution.find_task_terminal_failure(&scope).await {
        debug!(scope = %scope, "replaying recorded task failure");
        return Err(error);
    }

    // New task starts are refused once cancellation is durable.
    ctx.check_cancelled().map_err(|e| e.with_scope(scope.as_str()))?;

    // Secrets resolve before the first attempt; a missing secret fails the
    // envelope without running the body, retrying, or starting the task.
    let mut input = TaskInput::new(args.clone());
    if !options.secret_requests.is_empty() {
        let resolved = match &ctx.services().secrets {
            Some(store) => store.get(&options.secret_requests).await,
            None => Err(FluxError::secret_missing(&options.secret_requests)),
        };
        match resolved {
            Ok(secrets) => input.secrets = secrets,
            Err(error) => {
                let error = error.with_scope(scope.as_str());
                emit_failed(&execution, &scope, error.clone(), true).await?;
                return Err(error);
            }
        }
    }

    // Cache lookup: a hit emits the started/completed pair with the cached
    // value and never invokes the body.
    let fingerprint = options
        .cache
        .as_ref()
        .map(|_| task_fingerprint(execution.workflow_name(), scope.as_str(), &args));
    if let (Some(key), Some(cache)) = (&fingerprint, &ctx.services().cache) {
        if let Some(value) = cache.get(key).await? {
            emit(
                &execution,
                &scope,
                EventKind::TaskStarted,
                json!({"args": args, "cached": true}),
            )
            .await?;
            emit(
                &execution,
                &scope,
                EventKind::TaskCompleted,
                json!({"output": value, "cached": true}),
            )
            .await?;
            return Ok(value);
        }
    }

    emit(
        &execution,
        &scope,
        EventKind::TaskStarted,
        json!({"args": args}),
    )
    .await?;

    let retry = options.effective_retry(ctx.defaults());
    let timeout = options.effective_timeout(ctx.defaults());

    let mut attempt: u32 = 1;
    let primary_error: FluxError = loop {
        match run_attempt(ctx, &f, input.clone(), timeout).await {
            Ok(value) => {
                if attempt > 1 {
                    emit(
                        &execution,
                        &scope,
                        EventKind::TaskRetryCompleted,
                        json!(RetryPayload { attempt }),
                    )
                    .await?;
                }
                return finish_success(ctx, &scope, &options, fingerprint, value).await;
            }
            Err(error) if error.kind == ErrorKind::Cancelled => {
                // Mid-attempt cancellation: no further retries, no fallback;
                // rollback may still run to release resources.
                run_rollback(ctx, &scope, &options, &input).await?;
                return Err(error.with_scope(scope.as_str()));
            }
            Err(error) => {
                // Close this retry's started/failed pair before deciding
                // whether another attempt follows.
                if attempt > 1 {
                    emit(
                        &execution,
                        &scope,
                        EventKind::TaskRetryFailed,
                        json!(RetryPayload { attempt }),
                    )
                    .await?;
                }
                if !retry.has_attempts_remaining(attempt) {
                    break error;
                }
                let delay = retry.delay_for_attempt(attempt + 1);
                if !delay.is_zero() {
                    // Retry delays are suspension points
                    if ctx.sleep(delay).await.is_err() {
                        run_rollback(ctx, &scope, &options, &input).await?;
                        return Err(FluxError::cancelled().with_scope(scope.as_str()));
                    }
                }
                attempt += 1;
                emit(
                    &execution,
                    &scope,
                    EventKind::TaskRetryStarted,
                    json!(RetryPayload { attempt }),
                )
                .await?;
            }
        }
    };

    let primary_error = primary_error.with_scope(scope.as_str());
    let has_recovery = options.fallback.is_some() || options.rollback.is_some();
    emit_failed(&execution, &scope, primary_error.clone(), !has_recovery).await?;
    if !has_recovery {
        return Err(primary_error);
    }

    // Fallback sees the original input and the terminal error of the chain.
    let mut fallback_cause: Option<FluxError> = None;
    if let Some(fallback) = &options.fallback {
        if ctx.is_cancelled() {
            run_rollback(ctx, &scope, &options, &input).await?;
            return Err(FluxError::cancelled().with_scope(scope.as_str()));
        }
        emit(&execution, &scope, EventKind::TaskFallbackStarted, json!(null)).await?;
        match fallback(input.clone(), primary_error.clone()).await {
            Ok(value) => {
                emit(
                    &execution,
                    &scope,
                    EventKind::TaskFallbackCompleted,
                    json!(null),
                )
                .await?;
                return finish_success(ctx, &scope, &options, fingerprint, value).await;
            }
            Err(error) => {
                emit(
                    &execution,
                    &scope,
                    EventKind::TaskFallbackFailed,
                    json!({"error": error}),
                )
                .await?;
                fallback_cause = Some(error);
            }
        }
    }

    run_rollback(ctx, &scope, &options, &input).await?;

    let mut terminal = primary_error;
    if let Some(cause) = fallback_cause {
        terminal = terminal.with_cause(format!("fallback failed: {cause}"));
    }
    emit_failed(&execution, &scope, terminal.clone(), true).await?;
    Err(terminal)
}

/// One attempt raced against its timeout and the cancellation token.
async fn run_attempt(
    ctx: &WorkflowContext,
    f: &TaskFn,
    input: TaskInput,
    timeout: Option<Duration>,
) -> Result<Value, FluxError> {
    let body = f(input);
    match timeout {
        Some(limit) => tokio::select! {
            result = body => result,
            _ = tokio::time::sleep(limit) => Err(FluxError::timeout(format!(
                "attempt exceeded {}ms", limit.as_millis()
            ))),
            _ = ctx.cancellation().cancelled() => Err(FluxError::cancelled()),
        },
        None => tokio::select! {
            result = body => result,
            _ = ctx.cancellation().cancelled() => Err(FluxError::cancelled()),
        },
    }
}

/// Best-effort rollback; outcome is recorded but never raised.
async fn run_rollback(
    ctx: &WorkflowContext,
    scope: &ScopePath,
    options: &TaskOptions,
    input: &TaskInput,
) -> Result<(), FluxError> {
    let Some(rollback) = &options.rollback else {
        return Ok(());
    };
    let execution = ctx.execution();
    emit(execution, scope, EventKind::TaskRollbackStarted, json!(null)).await?;
    match rollback(input.clone()).await {
        Ok(_) => {
            emit(
                execution,
                scope,
                EventKind::TaskRollbackCompleted,
                json!(null),
            )
            .await?;
        }
        Err(error) => {
            warn!(scope = %scope, %error, "rollback handler failed");
            emit(
                execution,
                scope,
                EventKind::TaskRollbackFailed,
                json!({"error": error}),
            )
            .await?;
        }
    }
    Ok(())
}

/// Store the produced value (cache, output offload) and emit `TaskCompleted`.
async fn finish_success(
    ctx: &WorkflowContext,
    scope: &ScopePath,
    options: &TaskOptions,
    fingerprint: Option<String>,
    value: Value,
) -> Result<Value, FluxError> {
    let execution = ctx.execution();

    if let (Some(key), Some(policy), Some(cache)) =
        (&fingerprint, &options.cache, &ctx.services().cache)
    {
        cache.put(key, &value, policy.ttl).await?;
    }

    let recorded = offload_output(ctx, options, &value).await?;
    emit(
        execution,
        scope,
        EventKind::TaskCompleted,
        json!({"output": recorded}),
    )
    .await?;
    Ok(value)
}

/// Replace a large or explicitly external output with a storage reference.
async fn offload_output(
    ctx: &WorkflowContext,
    options: &TaskOptions,
    value: &Value,
) -> Result<Value, FluxError> {
    let Some(store) = &ctx.services().output else {
        return Ok(value.clone());
    };

    let oversized = match options.output_threshold {
        Some(threshold) => serde_json::to_vec(value)?.len() > threshold,
        None => false,
    };
    if !options.output_external && !oversized {
        return Ok(value.clone());
    }

    let reference_id = Uuid::now_v7().to_string();
    let reference: OutputReference = store.store(&reference_id, value).await?;
    Ok(reference.into_value())
}

async fn emit(
    execution: &crate::context::ExecutionContext,
    scope: &ScopePath,
    kind: EventKind,
    value: Value,
) -> Result<Event, FluxError> {
    execution.event(kind, scope, value).await
}

async fn emit_failed(
    execution: &crate::context::ExecutionContext,
    scope: &ScopePath,
    error: FluxError,
    terminal: bool,
) -> Result<(), FluxError> {
    execution
        .event(
            EventKind::TaskFailed,
            scope,
            json!(TaskFailedPayload { error, terminal }),
        )
        .await?;
    Ok(())
}
