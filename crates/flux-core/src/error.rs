//! Structured error model shared by the runtime, stores, and API surface

use serde::{Deserialize, Serialize};

/// Classification of every failure the engine can surface.
///
/// `CacheMiss` and `Paused` are internal control kinds: they never appear in
/// a terminal `WorkflowFailed` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    NoWorkerAvailable,
    Timeout,
    Cancelled,
    WorkerDisconnected,
    CacheMiss,
    StorageFailure,
    SecretMissing,
    UserTaskFailure,
    Internal,
    Paused,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::NoWorkerAvailable => "no_worker_available",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::WorkerDisconnected => "worker_disconnected",
            Self::CacheMiss => "cache_miss",
            Self::StorageFailure => "storage_failure",
            Self::SecretMissing => "secret_missing",
            Self::UserTaskFailure => "user_task_failure",
            Self::Internal => "internal",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Error type carried through workflow executions.
///
/// Serializable because it is embedded in `WorkflowFailed` and `TaskFailed`
/// event payloads and crosses the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FluxError {
    pub kind: ErrorKind,
    pub message: String,

    /// Scope path of the task that produced the error, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_scope: Option<String>,

    /// Messages of wrapped causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cause_chain: Vec<String>,
}

impl FluxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task_scope: None,
            cause_chain: vec![],
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled")
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageFailure, message)
    }

    pub fn secret_missing(names: &[String]) -> Self {
        Self::new(
            ErrorKind::SecretMissing,
            format!("missing secrets: {}", names.join(", ")),
        )
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserTaskFailure, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Control-flow marker for a workflow pausing at `pause(name)`.
    pub fn paused(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::Paused, name)
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.task_scope = Some(scope.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause_chain.push(cause.to_string());
        self
    }

    /// Whether the error is a control-flow marker rather than a real failure.
    pub fn is_control(&self) -> bool {
        matches!(self.kind, ErrorKind::Paused | ErrorKind::CacheMiss)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<serde_json::Error> for FluxError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind() {
        let err = FluxError::timeout("attempt exceeded 5s");
        assert_eq!(err.to_string(), "timeout: attempt exceeded 5s");
    }

    #[test]
    fn test_serde_round_trip() {
        let err = FluxError::user("boom")
            .with_scope("main.fetch")
            .with_cause("connection reset");

        let json = serde_json::to_string(&err).unwrap();
        let parsed: FluxError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
        assert!(json.contains("\"user_task_failure\""));
    }

    #[test]
    fn test_control_kinds() {
        assert!(FluxError::paused("approve").is_control());
        assert!(!FluxError::user("boom").is_control());
    }
}
