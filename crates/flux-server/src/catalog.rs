//! Workflow catalog service
//!
//! Registration allocates the next monotonic version for a name; entries
//! are immutable once written and superseded by higher versions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use flux_core::{FluxError, ResourceRequest};
use flux_storage::{CatalogEntry, CatalogStore};

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn register(
        &self,
        name: &str,
        source: Vec<u8>,
        imports: BTreeSet<String>,
        resource_request: ResourceRequest,
    ) -> Result<CatalogEntry, FluxError> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(FluxError::validation(
                "workflow name must be non-empty without whitespace",
            ));
        }
        if source.is_empty() {
            return Err(FluxError::validation("workflow source must not be empty"));
        }

        // Re-registering the exact latest source is a caller mistake, not a
        // new version.
        if let Ok(latest) = self.store.get_latest(name).await {
            if latest.source == source {
                return Err(FluxError::conflict(format!(
                    "workflow `{name}` v{} already registered with identical source",
                    latest.version
                )));
            }
        }

        let entry = self
            .store
            .register(name, source, imports, resource_request)
            .await
            .map_err(FluxError::from)?;
        info!(workflow = %entry.name, version = entry.version, "workflow registered");
        Ok(entry)
    }

    pub async fn list(&self) -> Result<Vec<(String, u32)>, FluxError> {
        self.store.list().await.map_err(FluxError::from)
    }

    pub async fn get(&self, name: &str, version: Option<u32>) -> Result<CatalogEntry, FluxError> {
        match version {
            Some(version) => self
                .store
                .get_version(name, version)
                .await
                .map_err(FluxError::from),
            None => self.store.get_latest(name).await.map_err(FluxError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::ErrorKind;
    use flux_storage::MemoryCatalogStore;

    fn service() -> CatalogService {
        CatalogService::new(Arc::new(MemoryCatalogStore::new()))
    }

    #[tokio::test]
    async fn test_register_bumps_version() {
        let catalog = service();
        let v1 = catalog
            .register("etl", b"a".to_vec(), Default::default(), Default::default())
            .await
            .unwrap();
        let v2 = catalog
            .register("etl", b"b".to_vec(), Default::default(), Default::default())
            .await
            .unwrap();

        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(catalog.get("etl", None).await.unwrap().version, 2);
        assert_eq!(catalog.get("etl", Some(1)).await.unwrap().source, b"a");
    }

    #[tokio::test]
    async fn test_identical_source_is_conflict() {
        let catalog = service();
        catalog
            .register("etl", b"same".to_vec(), Default::default(), Default::default())
            .await
            .unwrap();

        let error = catalog
            .register("etl", b"same".to_vec(), Default::default(), Default::default())
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_validation() {
        let catalog = service();
        assert_eq!(
            catalog
                .register("has space", b"x".to_vec(), Default::default(), Default::default())
                .await
                .unwrap_err()
                .kind,
            ErrorKind::Validation
        );
        assert_eq!(
            catalog
                .register("ok", vec![], Default::default(), Default::default())
                .await
                .unwrap_err()
                .kind,
            ErrorKind::Validation
        );
        assert_eq!(
            catalog.get("missing", None).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
    }
}
