use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{CheckError, ValidationTarget};

/// Rebuilds `value` with every object's keys in sorted order.
#[must_use]
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, inner)| (key, canonical_json(inner)))
                .collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), inner))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical serialization of `value`.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] if the value cannot be serialized.
pub fn hash_json(value: &Value) -> Result<String, CheckError> {
    let bytes = serde_json::to_vec(&canonical_json(value))
        .map_err(|err| CheckError::InvalidArgument(format!("unhashable JSON value: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Cache key identifying "the same validation target".
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] when the package name is empty.
pub fn target_hash(target: &ValidationTarget) -> Result<String, CheckError> {
    if target.package_name.trim().is_empty() {
        return Err(CheckError::missing("packageName"));
    }
    let value = serde_json::to_value(target)
        .map_err(|err| CheckError::InvalidArgument(format!("unhashable target: {err}")))?;
    hash_json(&value)
}

/// Dedup key of a rule set; an absent rule set hashes like JSON `null`.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] if the rule set cannot be serialized.
pub fn rule_set_hash(rule_set: Option<&Value>) -> Result<String, CheckError> {
    hash_json(rule_set.unwrap_or(&Value::Null))
}
