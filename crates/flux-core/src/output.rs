//! Output storage contract
//!
//! Large task outputs are written to an adapter and replaced in the event
//! log by a serializable reference. Consumers resolve the reference back to
//! the value when they need it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::FluxError;

/// Marker key embedding an [`OutputReference`] inside an event payload.
pub const OUTPUT_REF_KEY: &str = "$flux_output_ref";

/// Serializable pointer to an externally stored task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputReference {
    /// Adapter identifier, e.g. `inline` or `fs`.
    pub storage_type: String,
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl OutputReference {
    /// Wrap the reference in its event-payload form.
    pub fn into_value(self) -> Value {
        json!({ OUTPUT_REF_KEY: self })
    }

    /// Extract a reference from an event-payload value, if one is embedded.
    pub fn from_value(value: &Value) -> Option<OutputReference> {
        value
            .get(OUTPUT_REF_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Adapter identifier recorded in references.
    fn storage_type(&self) -> &str;

    async fn store(&self, reference_id: &str, value: &Value) -> Result<OutputReference, FluxError>;

    async fn retrieve(&self, reference: &OutputReference) -> Result<Value, FluxError>;

    async fn delete(&self, reference: &OutputReference) -> Result<(), FluxError>;
}

/// Dereference a value that may carry an embedded output reference.
pub async fn resolve_value(
    value: Value,
    store: Option<&dyn OutputStore>,
) -> Result<Value, FluxError> {
    match OutputReference::from_value(&value) {
        Some(reference) => match store {
            Some(store) => store.retrieve(&reference).await,
            None => Err(FluxError::storage(format!(
                "no output store configured to resolve {} reference {}",
                reference.storage_type, reference.reference_id
            ))),
        },
        None => Ok(value),
    }
}
