//! # Flux Storage
//!
//! Persistence for the orchestration engine: store traits over the abstract
//! state layout (workflows, executions, events, workers, schedules,
//! secrets, cache), an in-memory implementation for tests and
//! single-process deployments, and a PostgreSQL implementation for
//! production. Also home of the secrets encryption layer and the
//! output-storage adapters.

pub mod encryption;
pub mod memory;
pub mod output;
pub mod postgres;
pub mod secrets;
pub mod stores;

pub use encryption::{generate_master_key, MasterKey};
pub use memory::{
    MemoryCatalogStore, MemoryEventStore, MemoryExecutionStore, MemoryScheduleStore,
    MemorySecretsBackend, MemoryTaskCache, MemoryWorkerStore,
};
pub use output::{FsOutputStore, InlineOutputStore};
pub use postgres::PostgresStore;
pub use secrets::EncryptedSecretsStore;
pub use stores::{
    CacheEntry, CatalogEntry, CatalogStore, CatchUpPolicy, EventStore, ExecutionRecord,
    ExecutionStore, ScheduleRecord, ScheduleStore, ScheduleTrigger, SecretsBackend,
    StoreError, WorkerRecord, WorkerStatus, WorkerStore,
};
