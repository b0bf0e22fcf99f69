//! Canonical serialization and tamper hashing.
//!
//! Tamper hashes are SHA-256 over a canonical JSON rendering of a record's
//! semantic fields. Canonical means: object keys sorted, compact separators,
//! ISO-8601 timestamps. `serde_json` maps are backed by `BTreeMap` (the
//! `preserve_order` feature is not enabled), so serializing a `Value` object
//! already yields sorted keys.

use serde_json::Value as JsonValue;
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Sha3_256};

/// Render a JSON value canonically: sorted keys, compact separators.
pub fn canonical_json(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// SHA-256 over the canonical rendering of `value`, hex-encoded.
pub fn tamper_hash(value: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA3-256 over raw bytes, hex-encoded. Used for envelope payload hashes
/// and message content digests.
pub fn sha3_hex(bytes: &[u8]) -> String {
    hex::encode(Sha3_256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v = json!({"zebra": 1, "alpha": {"nested_z": true, "nested_a": false}});
        assert_eq!(
            canonical_json(&v),
            r#"{"alpha":{"nested_a":false,"nested_z":true},"zebra":1}"#
        );
    }

    #[test]
    fn test_tamper_hash_stable_under_key_order() {
        let a = json!({"content": "hi", "pinned": false});
        let b = json!({"pinned": false, "content": "hi"});
        assert_eq!(tamper_hash(&a), tamper_hash(&b));
    }

    #[test]
    fn test_tamper_hash_changes_with_content() {
        let a = json!({"content": "hi"});
        let b = json!({"content": "ho"});
        assert_ne!(tamper_hash(&a), tamper_hash(&b));
    }

    #[test]
    fn test_sha3_hex_len() {
        assert_eq!(sha3_hex(b"payload").len(), 64);
    }
}
