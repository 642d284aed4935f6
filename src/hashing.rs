//! Hashing System - SHA-256 for Configs and Artifacts
//!
//! Identical input must hash identically across runs; these digests are
//! how regeneration detects "nothing changed".

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Fingerprint of a resolved configuration for a given installer version.
/// config_hash = sha256(canonical_values + ":" + engine_version)
pub fn compute_config_hash(
    values: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(values)?;
    Ok(sha256_hex(format!("{canonical}:{engine_version}").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": {"y": [{"b": 1, "a": 0}], "x": null}});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":{"x":null,"y":[{"a":0,"b":1}]},"z":1}"#);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_config_hash_depends_on_version() {
        let values = json!({"output_dir": "/tmp/x", "enable_hybrid": true});
        let h1 = compute_config_hash(&values, "1.0.0").unwrap();
        let h2 = compute_config_hash(&values, "1.0.0").unwrap();
        let h3 = compute_config_hash(&values, "1.1.0").unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }
}
