//! Canonical JSON serialization for deterministic hashing
//!
//! Provides canonical JSON serialization with:
//! - Sorted map keys for determinism
//! - No whitespace
//! - Blake3 hashing for artifact verification

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Non-finite number in {0}")]
    NonFinite(String),
}

/// Serialize a value to canonical JSON (sorted keys, no whitespace)
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json_value = serde_json::to_value(value)
        .map_err(|e| CanonicalError::SerializationError(e.to_string()))?;

    let canonical = canonicalize_value(&json_value);
    serde_json::to_string(&canonical)
        .map_err(|e| CanonicalError::SerializationError(e.to_string()))
}

/// Pretty-printed canonical JSON, for human-read records such as metadata
pub fn to_canonical_json_pretty<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json_value = serde_json::to_value(value)
        .map_err(|e| CanonicalError::SerializationError(e.to_string()))?;

    serde_json::to_string_pretty(&canonicalize_value(&json_value))
        .map_err(|e| CanonicalError::SerializationError(e.to_string()))
}

/// Canonicalize a JSON value by sorting all object keys recursively
fn canonicalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut btree = BTreeMap::new();
            for (k, v) in map {
                btree.insert(k.clone(), canonicalize_value(v));
            }
            serde_json::Value::Object(btree.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}

/// Fail if any float in `values` cannot be represented in JSON
pub fn ensure_finite(context: &str, values: impl IntoIterator<Item = f64>) -> Result<(), CanonicalError> {
    if values.into_iter().all(f64::is_finite) {
        Ok(())
    } else {
        Err(CanonicalError::NonFinite(context.to_string()))
    }
}

/// Compute Blake3 hash of raw artifact bytes as a hex string
pub fn hash_bytes_hex(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestStruct {
        b_field: i64,
        a_field: f64,
        z_field: String,
    }

    fn sample() -> TestStruct {
        TestStruct {
            b_field: 2,
            a_field: 0.1 + 0.2,
            z_field: "test".to_string(),
        }
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let json = to_canonical_json(&sample()).unwrap();
        let a_pos = json.find("a_field").unwrap();
        let b_pos = json.find("b_field").unwrap();
        let z_pos = json.find("z_field").unwrap();
        assert!(a_pos < b_pos);
        assert!(b_pos < z_pos);
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_floats_round_trip_exactly() {
        let json = to_canonical_json(&sample()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let value = parsed["a_field"].as_f64().unwrap();
        assert_eq!(value.to_bits(), (0.1f64 + 0.2).to_bits());
    }

    #[test]
    fn test_hash_bytes_deterministic() {
        let h1 = hash_bytes_hex(b"artifact");
        let h2 = hash_bytes_hex(b"artifact");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_bytes_hex(b"artifact2"));
    }

    #[test]
    fn test_ensure_finite() {
        assert!(ensure_finite("ok", [1.0, -2.0]).is_ok());
        assert!(ensure_finite("bad", [1.0, f64::NAN]).is_err());
    }
}
