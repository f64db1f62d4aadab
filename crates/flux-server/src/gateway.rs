//! In-process implementation of the worker gateway
//!
//! Workers running in the same process (and the HTTP binding in
//! `api::workers`) both land here; the transport is the only difference.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use flux_core::{Event, FluxError};
use flux_protocol::{CheckpointAck, RegisterAck, RegisterRequest, WorkerCommand, WorkerGateway};

use crate::dispatcher::Dispatcher;
use crate::registry::WorkerRegistry;
use crate::sessions::SessionManager;
use crate::signals::Signals;

pub struct ServerGateway {
    registry: Arc<WorkerRegistry>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    signals: Arc<Signals>,
}

impl ServerGateway {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        signals: Arc<Signals>,
    ) -> Self {
        Self {
            registry,
            sessions,
            dispatcher,
            signals,
        }
    }
}

#[async_trait]
impl WorkerGateway for ServerGateway {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, FluxError> {
        let ack = self.registry.register(request).await?;
        // New capacity appeared
        self.signals.notify_dispatch();
        Ok(ack)
    }

    async fn open_stream(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<mpsc::Receiver<WorkerCommand>, FluxError> {
        let rx = self.sessions.open_stream(worker_id, session_token).await?;
        self.signals.notify_dispatch();
        Ok(rx)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        session_token: &str,
        _in_flight: u32,
    ) -> Result<(), FluxError> {
        self.registry.heartbeat(worker_id, session_token).await
    }

    async fn checkpoint(
        &self,
        worker_id: &str,
        session_token: &str,
        execution_id: Uuid,
        events: Vec<Event>,
    ) -> Result<CheckpointAck, FluxError> {
        self.sessions
            .checkpoint(worker_id, session_token, execution_id, events)
            .await
    }

    async fn drain(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.registry.drain(worker_id, session_token).await
    }

    async fn deregister(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.registry.deregister(worker_id, session_token).await?;
        self.sessions.disconnect(worker_id);
        // Anything still assigned to this worker goes back to the queue
        self.dispatcher.requeue_worker(worker_id).await?;
        Ok(())
    }
}
