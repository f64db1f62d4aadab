//! Encrypted secrets store
//!
//! Implements the core [`SecretsStore`] contract over a raw ciphertext
//! backend: values are encrypted with the deployment master key before they
//! touch the backend, and `get` fails atomically if any requested name is
//! missing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use flux_core::{FluxError, SecretsStore};

use crate::encryption::MasterKey;
use crate::stores::SecretsBackend;

pub struct EncryptedSecretsStore {
    backend: Arc<dyn SecretsBackend>,
    key: MasterKey,
}

impl EncryptedSecretsStore {
    pub fn new(backend: Arc<dyn SecretsBackend>, key: MasterKey) -> Self {
        Self { backend, key }
    }
}

#[async_trait]
impl SecretsStore for EncryptedSecretsStore {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, FluxError> {
        let mut resolved = HashMap::with_capacity(names.len());
        let mut missing = Vec::new();

        for name in names {
            match self.backend.get_raw(name).await.map_err(FluxError::from)? {
                Some(ciphertext) => {
                    let value = self.key.decrypt_to_string(&ciphertext).map_err(|e| {
                        FluxError::storage(format!("failed to decrypt secret `{name}`: {e}"))
                    })?;
                    resolved.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(FluxError::secret_missing(&missing));
        }
        Ok(resolved)
    }

    async fn put(&self, name: &str, value: &str) -> Result<(), FluxError> {
        let ciphertext = self
            .key
            .encrypt_string(value)
            .map_err(|e| FluxError::storage(format!("failed to encrypt secret `{name}`: {e}")))?;
        self.backend
            .put_raw(name, ciphertext)
            .await
            .map_err(FluxError::from)
    }

    async fn delete(&self, name: &str) -> Result<(), FluxError> {
        let existed = self
            .backend
            .delete_raw(name)
            .await
            .map_err(FluxError::from)?;
        if !existed {
            return Err(FluxError::not_found(format!("secret `{name}`")));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, FluxError> {
        self.backend.list_names().await.map_err(FluxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::generate_master_key;
    use crate::memory::MemorySecretsBackend;
    use flux_core::ErrorKind;

    fn test_store() -> EncryptedSecretsStore {
        let key = MasterKey::from_base64(&generate_master_key()).unwrap();
        EncryptedSecretsStore::new(Arc::new(MemorySecretsBackend::new()), key)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = test_store();
        store.put("api_key", "sk-123").await.unwrap();
        store.put("db_pass", "hunter2").await.unwrap();

        let values = store
            .get(&["api_key".to_string(), "db_pass".to_string()])
            .await
            .unwrap();
        assert_eq!(values["api_key"], "sk-123");
        assert_eq!(values["db_pass"], "hunter2");
    }

    #[tokio::test]
    async fn test_get_is_atomic() {
        let store = test_store();
        store.put("present", "v").await.unwrap();

        let error = store
            .get(&["present".to_string(), "absent".to_string()])
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::SecretMissing);
        assert!(error.message.contains("absent"));
        assert!(!error.message.contains("present"));
    }

    #[tokio::test]
    async fn test_values_encrypted_at_rest() {
        let backend = Arc::new(MemorySecretsBackend::new());
        let key = MasterKey::from_base64(&generate_master_key()).unwrap();
        let store = EncryptedSecretsStore::new(backend.clone(), key);

        store.put("s", "plaintext-value").await.unwrap();

        let raw = backend.get_raw("s").await.unwrap().unwrap();
        assert!(!raw.windows(15).any(|w| w == b"plaintext-value"));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = test_store();
        store.put("b", "2").await.unwrap();
        store.put("a", "1").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);

        store.delete("a").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["b"]);

        let error = store.delete("a").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotFound);
    }
}
