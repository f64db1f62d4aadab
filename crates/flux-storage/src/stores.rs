//! Store traits and record types
//!
//! These traits define the persistence interface of the engine.
//! Implementations must be thread-safe, support concurrent access, and keep
//! the events table append-only: UPDATEs are permitted only on the
//! executions summary row, as a projection of the latest terminal event.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flux_core::{Event, ExecutionState, FluxError, ResourceRequest, WorkerCapabilities};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Appended events are not contiguous with the stored log
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    /// Compare-and-set transition lost the race
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for FluxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => FluxError::not_found(msg),
            StoreError::SequenceConflict { .. } | StoreError::StateConflict(_) => {
                FluxError::conflict(err.to_string())
            }
            StoreError::VersionConflict(msg) => FluxError::conflict(msg),
            other => FluxError::storage(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// One row of the executions projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub state: ExecutionState,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<FluxError>,
    pub worker_id: Option<String>,
    /// Higher runs first among competing executions.
    pub priority: i32,
    /// Claim/assignment attempts so far.
    pub attempts: u32,
    /// Set when the execution was enqueued by a schedule.
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(workflow_name: impl Into<String>, workflow_version: u32, input: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            workflow_version,
            state: ExecutionState::Scheduled,
            input,
            output: None,
            error: None,
            worker_id: None,
            priority: 0,
            attempts: 0,
            schedule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

/// One immutable catalog entry: a registered workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: u32,
    /// Serialized workflow definition; opaque to the server.
    pub source: Vec<u8>,
    pub imports: BTreeSet<String>,
    pub resource_request: ResourceRequest,
    pub created_at: DateTime<Utc>,
}

/// Worker liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Draining,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Draining => write!(f, "draining"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Registered worker record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub session_name: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    /// Rotated on every registration; authenticates protocol calls.
    pub session_token: String,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// What fires a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    Cron { expr: String, timezone: String },
    Interval { period_ms: u64 },
}

/// Behavior after the scheduler was down across fire times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Enqueue only the most recent missed slot.
    #[default]
    OneBackfill,
    /// Drop all missed slots.
    Skip,
}

/// A cron- or interval-driven rule that enqueues executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: Uuid,
    pub workflow_name: String,
    pub trigger: ScheduleTrigger,
    pub input_template: Value,
    pub enabled: bool,
    /// Allow a fire while a previous execution of this schedule is live.
    pub allow_overlap: bool,
    pub catch_up: CatchUpPolicy,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn new(workflow_name: impl Into<String>, trigger: ScheduleTrigger) -> Self {
        Self {
            schedule_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            trigger,
            input_template: Value::Null,
            enabled: true,
            allow_overlap: false,
            catch_up: CatchUpPolicy::default(),
            last_fired_at: None,
            next_fire_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Append-only event log, indexed by `(execution_id, sequence)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events; the first new sequence must be contiguous with the
    /// stored log. Returns the next expected sequence.
    async fn append(&self, execution_id: Uuid, events: Vec<Event>) -> Result<u64, StoreError>;

    /// Load the full log in sequence order.
    async fn load(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Load events at or after `from_sequence`.
    async fn load_from(
        &self,
        execution_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Next expected sequence (0 for an empty log).
    async fn next_sequence(&self, execution_id: Uuid) -> Result<u64, StoreError>;
}

/// The executions summary projection.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    async fn get(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Overwrite the projection row (state, output, error, worker,
    /// attempts, updated_at).
    async fn update(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Atomic compare-and-set on the state column. Returns `false` when the
    /// current state no longer matches `from` (e.g. a concurrent claim).
    async fn transition(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn list_in_state(&self, state: ExecutionState)
        -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn list_for_worker(&self, worker_id: &str)
        -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// Versioned workflow catalog; entries are never mutated.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert with the next monotonic version for `name`.
    async fn register(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: BTreeSet<String>,
        resource_request: ResourceRequest,
    ) -> Result<CatalogEntry, StoreError>;

    async fn get_latest(&self, name: &str) -> Result<CatalogEntry, StoreError>;

    async fn get_version(&self, name: &str, version: u32) -> Result<CatalogEntry, StoreError>;

    /// `(name, latest_version)` pairs.
    async fn list(&self) -> Result<Vec<(String, u32)>, StoreError>;
}

/// Connected worker registry.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn upsert(&self, record: WorkerRecord) -> Result<(), StoreError>;

    async fn get(&self, worker_id: &str) -> Result<WorkerRecord, StoreError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    async fn update_status(&self, worker_id: &str, status: WorkerStatus)
        -> Result<(), StoreError>;

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn remove(&self, worker_id: &str) -> Result<(), StoreError>;
}

/// Schedule persistence.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, record: ScheduleRecord) -> Result<(), StoreError>;

    async fn get(&self, schedule_id: Uuid) -> Result<ScheduleRecord, StoreError>;

    async fn list(&self) -> Result<Vec<ScheduleRecord>, StoreError>;

    async fn update(&self, record: &ScheduleRecord) -> Result<(), StoreError>;

    async fn delete(&self, schedule_id: Uuid) -> Result<(), StoreError>;
}

/// Raw ciphertext KV under the encrypted secrets store.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    async fn get_raw(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put_raw(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError>;

    /// Returns whether the name existed.
    async fn delete_raw(&self, name: &str) -> Result<bool, StoreError>;

    async fn list_names(&self) -> Result<Vec<String>, StoreError>;
}

/// A cache row: value plus its expiry window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }
}
