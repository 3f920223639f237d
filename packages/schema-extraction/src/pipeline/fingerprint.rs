//! Canonical JSON hashing for the plan and classification caches.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::config::RunnerConfig;

/// Recursively sort object keys so equal documents serialize identically.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact, key-sorted JSON text.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a schema's canonical JSON (64 hex chars).
pub fn compute_schema_hash(schema: &Value) -> String {
    sha256_hex(&canonical_json(schema))
}

/// Plan cache key: hash of the canonical schema followed by the canonical
/// runner config.
pub fn plan_fingerprint(schema: &Value, config: &RunnerConfig) -> String {
    let config = to_value_or_null(config);
    sha256_hex(&format!("{}{}", canonical_json(schema), canonical_json(&config)))
}

fn to_value_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
