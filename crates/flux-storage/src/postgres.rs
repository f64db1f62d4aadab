//! PostgreSQL store implementation
//!
//! Production persistence over a shared connection pool. Events are
//! insert-only with contiguity enforced in a transaction; execution claims
//! use a conditional UPDATE so concurrent claimers cannot double-claim.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use flux_core::{
    Event, EventKind, ExecutionState, FluxError, ResourceRequest, TaskCache,
    WorkerCapabilities,
};

use crate::stores::*;

/// All store traits over one PostgreSQL pool.
///
/// # Example
///
/// ```ignore
/// use flux_storage::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flux").await?;
/// let store = PostgresStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the DDL in `schema.sql`. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("schema.sql"))
            .execute(&self.pool)
            .await?;
        debug!("schema ensured");
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(StoreError::from)
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(StoreError::from)
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected string encoding, got {other}"
        ))),
    }
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(s.to_string())).map_err(StoreError::from)
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let state: String = row.get("state");
    let error: Option<Value> = row.get("error");
    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        workflow_name: row.get("workflow_name"),
        workflow_version: row.get::<i32, _>("workflow_version") as u32,
        state: enum_from_str(&state)?,
        input: row.get("input"),
        output: row.get("output"),
        error: error.map(from_json::<FluxError>).transpose()?,
        worker_id: row.get("worker_id"),
        priority: row.get("priority"),
        attempts: row.get::<i32, _>("attempts") as u32,
        schedule_id: row.get("schedule_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    let kind: String = row.get("kind");
    Ok(Event {
        execution_id: row.get("execution_id"),
        sequence: row.get::<i64, _>("sequence") as u64,
        kind: enum_from_str::<EventKind>(&kind)?,
        source: row.get("source"),
        time: row.get("time"),
        value: row.get("value"),
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    #[instrument(skip(self, events))]
    async fn append(&self, execution_id: Uuid, events: Vec<Event>) -> Result<u64, StoreError> {
        if events.is_empty() {
            return self.next_sequence(execution_id).await;
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM flux_events WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await?;
        let expected = row.get::<i64, _>("n") as u64;

        if events[0].sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                actual: events[0].sequence,
            });
        }

        let mut next = expected;
        for event in &events {
            if event.sequence != next {
                return Err(StoreError::SequenceConflict {
                    expected: next,
                    actual: event.sequence,
                });
            }
            sqlx::query(
                r#"
                INSERT INTO flux_events (execution_id, sequence, kind, source, time, value)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(execution_id)
            .bind(event.sequence as i64)
            .bind(enum_str(&event.kind)?)
            .bind(&event.source)
            .bind(event.time)
            .bind(&event.value)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // Duplicate (execution_id, sequence) = a concurrent writer
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    StoreError::SequenceConflict {
                        expected: next,
                        actual: event.sequence,
                    }
                } else {
                    error!("failed to append event: {}", e);
                    StoreError::from(e)
                }
            })?;
            next += 1;
        }

        tx.commit().await?;
        Ok(next)
    }

    async fn load(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        self.load_from(execution_id, 0).await
    }

    async fn load_from(
        &self,
        execution_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, sequence, kind, source, time, value
            FROM flux_events
            WHERE execution_id = $1 AND sequence >= $2
            ORDER BY sequence
            "#,
        )
        .bind(execution_id)
        .bind(from_sequence as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn next_sequence(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM flux_events WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    #[instrument(skip(self, record), fields(execution_id = %record.execution_id))]
    async fn create(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flux_executions
                (execution_id, workflow_name, workflow_version, state, input, output,
                 error, worker_id, priority, attempts, schedule_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.execution_id)
        .bind(&record.workflow_name)
        .bind(record.workflow_version as i32)
        .bind(enum_str(&record.state)?)
        .bind(&record.input)
        .bind(&record.output)
        .bind(record.error.as_ref().map(to_json).transpose()?)
        .bind(&record.worker_id)
        .bind(record.priority)
        .bind(record.attempts as i32)
        .bind(record.schedule_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM flux_executions WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        execution_from_row(&row)
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flux_executions
            SET state = $2, output = $3, error = $4, worker_id = $5,
                attempts = $6, updated_at = now()
            WHERE execution_id = $1
            "#,
        )
        .bind(record.execution_id)
        .bind(enum_str(&record.state)?)
        .bind(&record.output)
        .bind(record.error.as_ref().map(to_json).transpose()?)
        .bind(&record.worker_id)
        .bind(record.attempts as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "execution {}",
                record.execution_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flux_executions
            SET state = $3, worker_id = $4, updated_at = now()
            WHERE execution_id = $1 AND state = $2
            "#,
        )
        .bind(execution_id)
        .bind(enum_str(&from)?)
        .bind(enum_str(&to)?)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_in_state(
        &self,
        state: ExecutionState,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM flux_executions WHERE state = $1 ORDER BY created_at",
        )
        .bind(enum_str(&state)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn list_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flux_executions WHERE worker_id = $1")
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(execution_from_row).collect()
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    #[instrument(skip(self, source, imports, resource_request))]
    async fn register(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: BTreeSet<String>,
        resource_request: ResourceRequest,
    ) -> Result<CatalogEntry, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS v FROM flux_workflows WHERE name = $1",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        let version = row.get::<i32, _>("v") as u32 + 1;

        let entry = CatalogEntry {
            name: name.to_string(),
            version,
            source,
            imports,
            resource_request,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO flux_workflows (name, version, source, imports, resource_request, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.name)
        .bind(entry.version as i32)
        .bind(&entry.source)
        .bind(to_json(&entry.imports)?)
        .bind(to_json(&entry.resource_request)?)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // Concurrent registration of the same name lost the race on
            // the (name, version) primary key
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false)
            {
                StoreError::VersionConflict(format!("workflow {name} v{version}"))
            } else {
                StoreError::from(e)
            }
        })?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn get_latest(&self, name: &str) -> Result<CatalogEntry, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM flux_workflows WHERE name = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow {name}")))?;
        catalog_from_row(&row)
    }

    async fn get_version(&self, name: &str, version: u32) -> Result<CatalogEntry, StoreError> {
        let row = sqlx::query("SELECT * FROM flux_workflows WHERE name = $1 AND version = $2")
            .bind(name)
            .bind(version as i32)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name} v{version}")))?;
        catalog_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, MAX(version) AS version FROM flux_workflows GROUP BY name ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("name"), row.get::<i32, _>("version") as u32))
            .collect())
    }
}

fn catalog_from_row(row: &sqlx::postgres::PgRow) -> Result<CatalogEntry, StoreError> {
    Ok(CatalogEntry {
        name: row.get("name"),
        version: row.get::<i32, _>("version") as u32,
        source: row.get("source"),
        imports: from_json(row.get("imports"))?,
        resource_request: from_json(row.get("resource_request"))?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl WorkerStore for PostgresStore {
    async fn upsert(&self, record: WorkerRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flux_workers
                (worker_id, session_name, capabilities, status, session_token, last_seen, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                session_name = EXCLUDED.session_name,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                session_token = EXCLUDED.session_token,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&record.worker_id)
        .bind(&record.session_name)
        .bind(to_json(&record.capabilities)?)
        .bind(enum_str(&record.status)?)
        .bind(&record.session_token)
        .bind(record.last_seen)
        .bind(record.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM flux_workers WHERE worker_id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        worker_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flux_workers ORDER BY registered_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn update_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE flux_workers SET status = $2 WHERE worker_id = $1")
            .bind(worker_id)
            .bind(enum_str(&status)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE flux_workers SET last_seen = $2 WHERE worker_id = $1")
            .bind(worker_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flux_workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkerRecord, StoreError> {
    let status: String = row.get("status");
    Ok(WorkerRecord {
        worker_id: row.get("worker_id"),
        session_name: row.get("session_name"),
        capabilities: from_json::<WorkerCapabilities>(row.get("capabilities"))?,
        status: enum_from_str(&status)?,
        session_token: row.get("session_token"),
        last_seen: row.get("last_seen"),
        registered_at: row.get("registered_at"),
    })
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn create(&self, record: ScheduleRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flux_schedules
                (schedule_id, workflow_name, trigger, input_template, enabled,
                 allow_overlap, catch_up, last_fired_at, next_fire_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.schedule_id)
        .bind(&record.workflow_name)
        .bind(to_json(&record.trigger)?)
        .bind(&record.input_template)
        .bind(record.enabled)
        .bind(record.allow_overlap)
        .bind(enum_str(&record.catch_up)?)
        .bind(record.last_fired_at)
        .bind(record.next_fire_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> Result<ScheduleRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM flux_schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("schedule {schedule_id}")))?;
        schedule_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM flux_schedules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update(&self, record: &ScheduleRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flux_schedules
            SET workflow_name = $2, trigger = $3, input_template = $4, enabled = $5,
                allow_overlap = $6, catch_up = $7, last_fired_at = $8, next_fire_at = $9
            WHERE schedule_id = $1
            "#,
        )
        .bind(record.schedule_id)
        .bind(&record.workflow_name)
        .bind(to_json(&record.trigger)?)
        .bind(&record.input_template)
        .bind(record.enabled)
        .bind(record.allow_overlap)
        .bind(enum_str(&record.catch_up)?)
        .bind(record.last_fired_at)
        .bind(record.next_fire_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "schedule {}",
                record.schedule_id
            )));
        }
        Ok(())
    }

    async fn delete(&self, schedule_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM flux_schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {schedule_id}")));
        }
        Ok(())
    }
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<ScheduleRecord, StoreError> {
    let catch_up: String = row.get("catch_up");
    Ok(ScheduleRecord {
        schedule_id: row.get("schedule_id"),
        workflow_name: row.get("workflow_name"),
        trigger: from_json(row.get("trigger"))?,
        input_template: row.get("input_template"),
        enabled: row.get("enabled"),
        allow_overlap: row.get("allow_overlap"),
        catch_up: enum_from_str(&catch_up)?,
        last_fired_at: row.get("last_fired_at"),
        next_fire_at: row.get("next_fire_at"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl SecretsBackend for PostgresStore {
    async fn get_raw(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT ciphertext FROM flux_secrets WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("ciphertext")))
    }

    async fn put_raw(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flux_secrets (name, ciphertext) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET ciphertext = EXCLUDED.ciphertext
            "#,
        )
        .bind(name)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_raw(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM flux_secrets WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT name FROM flux_secrets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }
}

#[async_trait]
impl TaskCache for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, FluxError> {
        let row = sqlx::query(
            r#"
            SELECT value FROM flux_cache
            WHERE key = $1
              AND created_at + (ttl_ms * interval '1 millisecond') > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FluxError::storage(e.to_string()))?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), FluxError> {
        sqlx::query(
            r#"
            INSERT INTO flux_cache (key, value, created_at, ttl_ms)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                created_at = EXCLUDED.created_at,
                ttl_ms = EXCLUDED.ttl_ms
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| FluxError::storage(e.to_string()))?;
        Ok(())
    }

    async fn purge(&self) -> Result<(), FluxError> {
        sqlx::query(
            "DELETE FROM flux_cache WHERE created_at + (ttl_ms * interval '1 millisecond') <= now()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FluxError::storage(e.to_string()))?;
        Ok(())
    }
}
