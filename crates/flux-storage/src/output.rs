//! Output-storage adapters
//!
//! Both adapters implement the core [`OutputStore`] contract: the inline
//! adapter keeps values in process memory, the filesystem adapter writes
//! one JSON file per reference under a configured root.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use flux_core::{FluxError, OutputReference, OutputStore};

pub const STORAGE_TYPE_INLINE: &str = "inline";
pub const STORAGE_TYPE_FS: &str = "fs";

/// In-memory (inline) adapter.
#[derive(Default)]
pub struct InlineOutputStore {
    values: DashMap<String, Value>,
}

impl InlineOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl OutputStore for InlineOutputStore {
    fn storage_type(&self) -> &str {
        STORAGE_TYPE_INLINE
    }

    async fn store(&self, reference_id: &str, value: &Value) -> Result<OutputReference, FluxError> {
        self.values.insert(reference_id.to_string(), value.clone());
        Ok(OutputReference {
            storage_type: STORAGE_TYPE_INLINE.to_string(),
            reference_id: reference_id.to_string(),
            metadata: Value::Null,
        })
    }

    async fn retrieve(&self, reference: &OutputReference) -> Result<Value, FluxError> {
        self.values
            .get(&reference.reference_id)
            .map(|v| v.clone())
            .ok_or_else(|| {
                FluxError::not_found(format!("output reference {}", reference.reference_id))
            })
    }

    async fn delete(&self, reference: &OutputReference) -> Result<(), FluxError> {
        self.values.remove(&reference.reference_id);
        Ok(())
    }
}

/// Filesystem adapter: `<root>/<reference_id>.json`.
pub struct FsOutputStore {
    root: PathBuf,
}

impl FsOutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference_id: &str) -> Result<PathBuf, FluxError> {
        // Reference ids are generated UUIDs; refuse anything that could
        // escape the storage root.
        if reference_id.is_empty()
            || reference_id
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(FluxError::validation(format!(
                "invalid output reference id `{reference_id}`"
            )));
        }
        Ok(self.root.join(format!("{reference_id}.json")))
    }
}

#[async_trait]
impl OutputStore for FsOutputStore {
    fn storage_type(&self) -> &str {
        STORAGE_TYPE_FS
    }

    async fn store(&self, reference_id: &str, value: &Value) -> Result<OutputReference, FluxError> {
        let path = self.path_for(reference_id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| FluxError::storage(format!("create {}: {e}", self.root.display())))?;

        let bytes = serde_json::to_vec(value)?;
        let size = bytes.len();
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FluxError::storage(format!("write {}: {e}", path.display())))?;

        Ok(OutputReference {
            storage_type: STORAGE_TYPE_FS.to_string(),
            reference_id: reference_id.to_string(),
            metadata: json!({ "bytes": size }),
        })
    }

    async fn retrieve(&self, reference: &OutputReference) -> Result<Value, FluxError> {
        let path = self.path_for(&reference.reference_id)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FluxError::not_found(format!("output reference {}", reference.reference_id))
            } else {
                FluxError::storage(format!("read {}: {e}", path.display()))
            }
        })?;
        serde_json::from_slice(&bytes).map_err(FluxError::from)
    }

    async fn delete(&self, reference: &OutputReference) -> Result<(), FluxError> {
        let path = self.path_for(&reference.reference_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FluxError::storage(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}
