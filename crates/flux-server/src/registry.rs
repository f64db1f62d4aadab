//! Worker registry: registration, liveness, and live capacity accounting

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use flux_core::{FluxError, ResourceRequest, WorkerCapabilities};
use flux_protocol::{RegisterAck, RegisterRequest};
use flux_storage::{WorkerRecord, WorkerStatus, WorkerStore};

const SESSION_TOKEN_LEN: usize = 32;

/// Per-worker live view: what is currently reserved on it.
#[derive(Debug, Clone, Default)]
struct LiveLoad {
    reservations: Vec<(Uuid, ResourceRequest)>,
}

impl LiveLoad {
    fn reserved(&self) -> ResourceRequest {
        let mut total = ResourceRequest::new();
        let mut cpu = 0.0;
        let mut memory = 0u64;
        for (_, request) in &self.reservations {
            cpu += request.cpu.unwrap_or(0.0);
            memory += request.memory_bytes.unwrap_or(0);
        }
        if cpu > 0.0 {
            total.cpu = Some(cpu);
        }
        if memory > 0 {
            total.memory_bytes = Some(memory);
        }
        total
    }
}

/// A worker eligible for assignment, with its remaining capacity.
#[derive(Debug, Clone)]
pub struct EligibleWorker {
    pub record: WorkerRecord,
    pub free: WorkerCapabilities,
    pub in_flight: usize,
}

/// Tracks connected workers, their capabilities, and liveness.
pub struct WorkerRegistry {
    store: Arc<dyn WorkerStore>,
    load: DashMap<String, LiveLoad>,
    heartbeat_timeout: Duration,
    heartbeat_interval: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn WorkerStore>, heartbeat_timeout: Duration) -> Self {
        Self {
            store,
            load: DashMap::new(),
            heartbeat_timeout,
            heartbeat_interval: heartbeat_timeout / 3,
        }
    }

    fn new_session_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_TOKEN_LEN)
            .map(char::from)
            .collect()
    }

    /// Register a worker: allocate an id, rotate the session token, mark
    /// it online.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, FluxError> {
        let worker_id = format!("worker-{}", Uuid::now_v7());
        let session_token = Self::new_session_token();
        let now = Utc::now();

        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            session_name: request.session_name,
            capabilities: request.capabilities,
            status: WorkerStatus::Online,
            session_token: session_token.clone(),
            last_seen: now,
            registered_at: now,
        };
        self.store.upsert(record).await.map_err(FluxError::from)?;
        self.load.insert(worker_id.clone(), LiveLoad::default());

        info!(%worker_id, "worker registered");
        Ok(RegisterAck {
            worker_id,
            session_token,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
        })
    }

    /// Validate a `(worker_id, session_token)` pair.
    pub async fn authenticate(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<WorkerRecord, FluxError> {
        let record = self.store.get(worker_id).await.map_err(FluxError::from)?;
        if record.session_token != session_token {
            return Err(FluxError::validation("invalid session token"));
        }
        Ok(record)
    }

    /// Record a heartbeat; brings an `Offline` worker back online (a
    /// reconnect within the orphan window resumes its executions).
    pub async fn heartbeat(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        let record = self.authenticate(worker_id, session_token).await?;
        self.store
            .heartbeat(worker_id, Utc::now())
            .await
            .map_err(FluxError::from)?;
        if record.status == WorkerStatus::Offline {
            info!(%worker_id, "offline worker reconnected");
            self.store
                .update_status(worker_id, WorkerStatus::Online)
                .await
                .map_err(FluxError::from)?;
        }
        Ok(())
    }

    pub async fn drain(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.authenticate(worker_id, session_token).await?;
        info!(%worker_id, "worker draining");
        self.store
            .update_status(worker_id, WorkerStatus::Draining)
            .await
            .map_err(FluxError::from)
    }

    pub async fn deregister(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        self.authenticate(worker_id, session_token).await?;
        self.load.remove(worker_id);
        info!(%worker_id, "worker deregistered");
        self.store.remove(worker_id).await.map_err(FluxError::from)
    }

    pub async fn get(&self, worker_id: &str) -> Result<WorkerRecord, FluxError> {
        self.store.get(worker_id).await.map_err(FluxError::from)
    }

    pub async fn list(&self) -> Result<Vec<WorkerRecord>, FluxError> {
        self.store.list().await.map_err(FluxError::from)
    }

    /// Reserve capacity for an execution on a worker.
    pub fn reserve(&self, worker_id: &str, execution_id: Uuid, request: ResourceRequest) {
        self.load
            .entry(worker_id.to_string())
            .or_default()
            .reservations
            .push((execution_id, request));
    }

    /// Release an execution's reservation wherever it is held.
    pub fn release(&self, execution_id: Uuid) {
        for mut entry in self.load.iter_mut() {
            entry
                .reservations
                .retain(|(id, _)| *id != execution_id);
        }
    }

    pub fn in_flight(&self, worker_id: &str) -> usize {
        self.load
            .get(worker_id)
            .map(|l| l.reservations.len())
            .unwrap_or(0)
    }

    /// Snapshot of online, non-draining workers with spare concurrency,
    /// each with its remaining capacity.
    pub async fn eligible(&self) -> Result<Vec<EligibleWorker>, FluxError> {
        let mut eligible = Vec::new();
        for record in self.list().await? {
            if record.status != WorkerStatus::Online {
                continue;
            }
            let in_flight = self.in_flight(&record.worker_id);
            if in_flight >= record.capabilities.max_concurrent as usize {
                continue;
            }
            let reserved = self
                .load
                .get(&record.worker_id)
                .map(|l| l.reserved())
                .unwrap_or_default();
            let free = record.capabilities.minus(&reserved);
            eligible.push(EligibleWorker {
                record,
                free,
                in_flight,
            });
        }
        Ok(eligible)
    }

    /// Mark workers that missed the heartbeat window `Offline`. Returns the
    /// ids that just went offline.
    pub async fn reap_expired(&self) -> Result<Vec<String>, FluxError> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for record in self.list().await? {
            if record.status == WorkerStatus::Offline {
                continue;
            }
            let silent_for = now
                .signed_duration_since(record.last_seen)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if silent_for > self.heartbeat_timeout {
                warn!(worker_id = %record.worker_id, ?silent_for, "worker missed heartbeat window");
                self.store
                    .update_status(&record.worker_id, WorkerStatus::Offline)
                    .await
                    .map_err(FluxError::from)?;
                expired.push(record.worker_id);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_storage::MemoryWorkerStore;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(
            Arc::new(MemoryWorkerStore::new()),
            Duration::from_secs(15),
        )
    }

    fn request(name: &str) -> RegisterRequest {
        RegisterRequest {
            session_name: name.to_string(),
            capabilities: WorkerCapabilities {
                cpu: 4.0,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let registry = registry();
        let ack = registry.register(request("host-a")).await.unwrap();

        assert!(ack.worker_id.starts_with("worker-"));
        assert_eq!(ack.session_token.len(), SESSION_TOKEN_LEN);

        registry
            .authenticate(&ack.worker_id, &ack.session_token)
            .await
            .unwrap();
        let error = registry
            .authenticate(&ack.worker_id, "wrong-token")
            .await
            .unwrap_err();
        assert_eq!(error.kind, flux_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_reservations_shrink_free_capacity() {
        let registry = registry();
        let ack = registry.register(request("host-a")).await.unwrap();
        let execution_id = Uuid::now_v7();

        registry.reserve(
            &ack.worker_id,
            execution_id,
            ResourceRequest::new().with_cpu(3.0),
        );

        let eligible = registry.eligible().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].free.cpu, 1.0);
        assert_eq!(eligible[0].in_flight, 1);

        registry.release(execution_id);
        let eligible = registry.eligible().await.unwrap();
        assert_eq!(eligible[0].free.cpu, 4.0);
        assert_eq!(eligible[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_draining_workers_not_eligible() {
        let registry = registry();
        let ack = registry.register(request("host-a")).await.unwrap();

        registry
            .drain(&ack.worker_id, &ack.session_token)
            .await
            .unwrap();
        assert!(registry.eligible().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reaper_marks_silent_workers_offline() {
        let store = Arc::new(MemoryWorkerStore::new());
        let registry = WorkerRegistry::new(store.clone(), Duration::from_millis(10));
        let ack = registry.register(request("host-a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let expired = registry.reap_expired().await.unwrap();
        assert_eq!(expired, vec![ack.worker_id.clone()]);

        let record = store.get(&ack.worker_id).await.unwrap();
        assert_eq!(record.status, WorkerStatus::Offline);

        // A heartbeat brings it back
        registry
            .heartbeat(&ack.worker_id, &ack.session_token)
            .await
            .unwrap();
        let record = store.get(&ack.worker_id).await.unwrap();
        assert_eq!(record.status, WorkerStatus::Online);
    }
}
