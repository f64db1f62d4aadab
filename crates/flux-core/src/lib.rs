//! # Flux Core
//!
//! The execution model of the Flux workflow engine:
//!
//! - **Event-sourced executions**: every state change is an immutable event;
//!   replaying the log from sequence 0 reconstructs the execution
//! - **Durable task envelope**: retry, fallback, rollback, per-attempt
//!   timeout, and cache around every task invocation
//! - **Composition**: `parallel`, `pipeline`, `map`, and validated `graph`
//!   primitives with structured cancellation
//! - **Contracts**: secrets, output storage, and task cache interfaces the
//!   runtime depends on
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Workflow::run(ctx)                      │
//! │        (user code; tasks, pause points, composition)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Task envelope                          │
//! │   (replay → secrets → cache → retry → fallback → rollback)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ExecutionContext + EventSink              │
//! │       (single-writer sequence, durable before progress)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod context;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod output;
pub mod resources;
pub mod scope;
pub mod secrets;
pub mod state;
pub mod task;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cache::TaskCache;
    pub use crate::context::{BufferSink, EventSink, ExecutionContext};
    pub use crate::error::{ErrorKind, FluxError};
    pub use crate::event::{Event, EventKind};
    pub use crate::output::{OutputReference, OutputStore};
    pub use crate::resources::{ResourceRequest, WorkerCapabilities};
    pub use crate::scope::ScopePath;
    pub use crate::secrets::SecretsStore;
    pub use crate::state::{ExecutionSnapshot, ExecutionState};
    pub use crate::task::{
        branch, fallback_fn, map, parallel, pipeline, rollback_fn, task_fn, CachePolicy,
        Graph, RetryPolicy, RuntimeDefaults, TaskInput, TaskOptions,
    };
    pub use crate::workflow::{RuntimeServices, Workflow, WorkflowContext, WorkflowRegistry};
}

pub use cache::TaskCache;
pub use context::{BufferSink, EventSink, ExecutionContext};
pub use error::{ErrorKind, FluxError};
pub use event::{Event, EventKind};
pub use output::{OutputReference, OutputStore};
pub use resources::{ResourceRequest, WorkerCapabilities};
pub use scope::ScopePath;
pub use secrets::SecretsStore;
pub use state::{ExecutionSnapshot, ExecutionState};
pub use workflow::{RuntimeServices, Workflow, WorkflowContext, WorkflowRegistry};
