//! The transport seam between workers and the server
//!
//! Both bindings implement this trait: the in-process one hands out channel
//! receivers directly, the HTTP one maps each method onto the worker routes
//! (registration POST, SSE command stream, checkpoint callbacks).

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use flux_core::{Event, FluxError};

use crate::messages::{CheckpointAck, RegisterAck, RegisterRequest, WorkerCommand};

/// Everything a worker needs from the server.
///
/// All calls after `register` are authenticated by the
/// `(worker_id, session_token)` pair issued in the `RegisterAck`.
#[async_trait]
pub trait WorkerGateway: Send + Sync {
    /// Register the worker; allocates a worker id and rotates the session
    /// token.
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, FluxError>;

    /// Open the server-pushed execution stream. Dropping the receiver (or
    /// the underlying connection) tells the server the worker went away.
    async fn open_stream(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<mpsc::Receiver<WorkerCommand>, FluxError>;

    /// Liveness signal; also reports current load.
    async fn heartbeat(
        &self,
        worker_id: &str,
        session_token: &str,
        in_flight: u32,
    ) -> Result<(), FluxError>;

    /// Deliver newly produced events. The server validates the session,
    /// the assignment, and sequence contiguity before appending; the ack
    /// carries the highest accepted sequence.
    async fn checkpoint(
        &self,
        worker_id: &str,
        session_token: &str,
        execution_id: Uuid,
        events: Vec<Event>,
    ) -> Result<CheckpointAck, FluxError>;

    /// Stop receiving new assignments; in-flight executions finish.
    async fn drain(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError>;

    /// Remove the worker from the registry.
    async fn deregister(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError>;
}
