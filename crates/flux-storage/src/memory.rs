//! In-memory store implementations
//!
//! Primarily for tests and single-process deployments. Same semantics as
//! the PostgreSQL implementations, including append-only events and
//! compare-and-set state transitions.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use flux_core::{Event, ExecutionState, FluxError, ResourceRequest, TaskCache};

use crate::stores::*;

/// In-memory append-only event log.
#[derive(Default)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<Uuid, Vec<Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self, execution_id: Uuid) -> usize {
        self.logs
            .read()
            .get(&execution_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, execution_id: Uuid, events: Vec<Event>) -> Result<u64, StoreError> {
        if events.is_empty() {
            return self.next_sequence(execution_id).await;
        }
        let mut logs = self.logs.write();
        let log = logs.entry(execution_id).or_default();

        let expected = log.len() as u64;
        let first = events[0].sequence;
        if first != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                actual: first,
            });
        }
        for (offset, event) in events.iter().enumerate() {
            if event.sequence != expected + offset as u64 {
                return Err(StoreError::SequenceConflict {
                    expected: expected + offset as u64,
                    actual: event.sequence,
                });
            }
        }

        log.extend(events);
        Ok(log.len() as u64)
    }

    async fn load(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .logs
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_from(
        &self,
        execution_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .logs
            .read()
            .get(&execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn next_sequence(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .logs
            .read()
            .get(&execution_id)
            .map(|l| l.len() as u64)
            .unwrap_or(0))
    }
}

/// In-memory executions projection.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(record.execution_id, record);
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let existing = executions
            .get_mut(&record.execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", record.execution_id)))?;
        let mut updated = record.clone();
        updated.updated_at = Utc::now();
        *existing = updated;
        Ok(())
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;

        if record.state != from {
            return Ok(false);
        }
        record.state = to;
        record.worker_id = worker_id.map(String::from);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_in_state(
        &self,
        state: ExecutionState,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .read()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn list_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|r| r.worker_id.as_deref() == Some(worker_id))
            .cloned()
            .collect())
    }
}

/// In-memory workflow catalog.
#[derive(Default)]
pub struct MemoryCatalogStore {
    // name -> version -> entry
    workflows: RwLock<HashMap<String, BTreeMap<u32, CatalogEntry>>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn register(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: std::collections::BTreeSet<String>,
        resource_request: ResourceRequest,
    ) -> Result<CatalogEntry, StoreError> {
        let mut workflows = self.workflows.write();
        let versions = workflows.entry(name.to_string()).or_default();
        let version = versions.keys().next_back().copied().unwrap_or(0) + 1;
        let entry = CatalogEntry {
            name: name.to_string(),
            version,
            source,
            imports,
            resource_request,
            created_at: Utc::now(),
        };
        versions.insert(version, entry.clone());
        Ok(entry)
    }

    async fn get_latest(&self, name: &str) -> Result<CatalogEntry, StoreError> {
        self.workflows
            .read()
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name}")))
    }

    async fn get_version(&self, name: &str, version: u32) -> Result<CatalogEntry, StoreError> {
        self.workflows
            .read()
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name} v{version}")))
    }

    async fn list(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let mut entries: Vec<(String, u32)> = self
            .workflows
            .read()
            .iter()
            .filter_map(|(name, versions)| {
                versions
                    .keys()
                    .next_back()
                    .map(|version| (name.clone(), *version))
            })
            .collect();
        entries.sort();
        Ok(entries)
    }
}

/// In-memory worker registry.
#[derive(Default)]
pub struct MemoryWorkerStore {
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl MemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerStore for MemoryWorkerStore {
    async fn upsert(&self, record: WorkerRecord) -> Result<(), StoreError> {
        self.workers
            .write()
            .insert(record.worker_id.clone(), record);
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<WorkerRecord, StoreError> {
        self.workers
            .read()
            .get(worker_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self.workers.read().values().cloned().collect())
    }

    async fn update_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        record.status = status;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        record.last_seen = at;
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> Result<(), StoreError> {
        self.workers.write().remove(worker_id);
        Ok(())
    }
}

/// In-memory schedule store.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<Uuid, ScheduleRecord>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn create(&self, record: ScheduleRecord) -> Result<(), StoreError> {
        self.schedules
            .write()
            .insert(record.schedule_id, record);
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> Result<ScheduleRecord, StoreError> {
        self.schedules
            .read()
            .get(&schedule_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("schedule {schedule_id}")))
    }

    async fn list(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let mut records: Vec<ScheduleRecord> =
            self.schedules.read().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn update(&self, record: &ScheduleRecord) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&record.schedule_id) {
            return Err(StoreError::NotFound(format!(
                "schedule {}",
                record.schedule_id
            )));
        }
        schedules.insert(record.schedule_id, record.clone());
        Ok(())
    }

    async fn delete(&self, schedule_id: Uuid) -> Result<(), StoreError> {
        self.schedules
            .write()
            .remove(&schedule_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("schedule {schedule_id}")))
    }
}

/// In-memory ciphertext KV for secrets.
#[derive(Default)]
pub struct MemorySecretsBackend {
    secrets: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySecretsBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretsBackend for MemorySecretsBackend {
    async fn get_raw(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.secrets.read().get(name).cloned())
    }

    async fn put_raw(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError> {
        self.secrets.write().insert(name.to_string(), ciphertext);
        Ok(())
    }

    async fn delete_raw(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.secrets.write().remove(name).is_some())
    }

    async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.secrets.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// In-memory task cache with TTL, last-write-wins.
#[derive(Default)]
pub struct MemoryTaskCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryTaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl TaskCache for MemoryTaskCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, FluxError> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), FluxError> {
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value: value.clone(),
                created_at: Utc::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn purge(&self) -> Result<(), FluxError> {
        let now = Utc::now();
        self.entries.write().retain(|_, entry| !entry.is_expired(now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{EventKind, ScopePath};
    use serde_json::json;

    fn ev(execution_id: Uuid, seq: u64) -> Event {
        Event::new(
            execution_id,
            seq,
            EventKind::Checkpoint,
            &ScopePath::root("wf"),
            json!(null),
        )
    }

    #[tokio::test]
    async fn test_event_append_contiguity() {
        let store = MemoryEventStore::new();
        let id = Uuid::now_v7();

        let next = store.append(id, vec![ev(id, 0), ev(id, 1)]).await.unwrap();
        assert_eq!(next, 2);

        // A gap is rejected
        let err = store.append(id, vec![ev(id, 5)]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceConflict {
                expected: 2,
                actual: 5
            }
        ));

        // A replayed duplicate is rejected
        let err = store.append(id, vec![ev(id, 1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::SequenceConflict { .. }));

        assert_eq!(store.load(id).await.unwrap().len(), 2);
        assert_eq!(store.load_from(id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execution_transition_cas() {
        let store = MemoryExecutionStore::new();
        let record = ExecutionRecord::new("wf", 1, json!(null));
        let id = record.execution_id;
        store.create(record).await.unwrap();

        let claimed = store
            .transition(id, ExecutionState::Scheduled, ExecutionState::Claimed, Some("w1"))
            .await
            .unwrap();
        assert!(claimed);

        // Second claim loses the race
        let claimed_again = store
            .transition(id, ExecutionState::Scheduled, ExecutionState::Claimed, Some("w2"))
            .await
            .unwrap();
        assert!(!claimed_again);

        let record = store.get(id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Claimed);
        assert_eq!(record.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_catalog_versions_are_monotonic() {
        let store = MemoryCatalogStore::new();
        let first = store
            .register("etl", b"v1".to_vec(), Default::default(), Default::default())
            .await
            .unwrap();
        let second = store
            .register("etl", b"v2".to_vec(), Default::default(), Default::default())
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.get_latest("etl").await.unwrap().version, 2);
        assert_eq!(store.get_version("etl", 1).await.unwrap().source, b"v1");
        assert_eq!(store.list().await.unwrap(), vec![("etl".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let cache = MemoryTaskCache::new();
        cache
            .put("k", &json!(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.purge().await.unwrap();
        assert!(cache.is_empty());
    }
}
