//! Stable fingerprints over task arguments
//!
//! Cache keys and argument digests must not depend on JSON key order, so
//! values are canonicalized (object keys sorted recursively) before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: object keys sorted at every
/// level, arrays in order, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        // Scalars already have a stable serde encoding
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Fingerprint of a task invocation: `sha256(workflow_name, scope_path,
/// canonical(args))`, hex encoded. Used as the cache key.
pub fn task_fingerprint(workflow_name: &str, scope_path: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(scope_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}
