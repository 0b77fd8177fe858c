//! Canonical JSON form: object keys sorted recursively, array order kept.
//!
//! Filter documents are canonicalized before translation so that two
//! semantically identical filters compile to the same SQL text, whatever key
//! order the client happened to send.

use std::collections::BTreeMap;

use serde_json::Value;

pub fn canonicalize_json_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json_value).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(k, v)| (k, canonicalize_json_value(v)))
                .collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        scalar => scalar.clone(),
    }
}

/// Compact serialization of the canonical form.
pub fn canonical_json_string(value: &Value) -> String {
    serde_json::to_string(&canonicalize_json_value(value)).unwrap_or_else(|_| "null".to_string())
}
