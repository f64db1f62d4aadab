//! Secrets store contract
//!
//! The runtime resolves a task's `secret_requests` through this interface
//! before the first attempt. Implementations encrypt values at rest; the
//! in-memory test double lives with the storage crate.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::FluxError;

#[async_trait]
pub trait SecretsStore: Send + Sync {
    /// Resolve all names at once. Fails atomically with `secret_missing`
    /// (listing every absent name) if any requested name does not exist.
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, FluxError>;

    async fn put(&self, name: &str, value: &str) -> Result<(), FluxError>;

    async fn delete(&self, name: &str) -> Result<(), FluxError>;

    /// Names only; values are never listed.
    async fn list(&self) -> Result<Vec<String>, FluxError>;
}
