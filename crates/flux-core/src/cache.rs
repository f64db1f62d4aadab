//! Task cache contract
//!
//! Keys are fingerprints of `(workflow_name, scope_path, canonical_args)`;
//! writes are last-write-wins and readers tolerate TTL-bounded staleness.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FluxError;

#[async_trait]
pub trait TaskCache: Send + Sync {
    /// Fetch a non-expired entry.
    async fn get(&self, key: &str) -> Result<Option<Value>, FluxError>;

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), FluxError>;

    /// Drop expired entries.
    async fn purge(&self) -> Result<(), FluxError>;
}
