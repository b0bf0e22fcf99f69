//! Per-teambook encrypted key/value storage types.

use crate::{AiId, Timestamp};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static VAULT_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("vault key regex"));

/// Validate a vault key: alphanumerics plus `._-`, max 128 chars.
pub fn is_valid_vault_key(key: &str) -> bool {
    VAULT_KEY_RE.is_match(key)
}

/// An encrypted vault entry. The value is opaque AEAD ciphertext encrypted
/// with the teambook-scoped symmetric key; `list()` exposes metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultItem {
    pub key: String,
    #[serde(with = "serde_bytes_b64")]
    pub encrypted_value: Vec<u8>,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub author: AiId,
}

/// Metadata-only view returned by `vault_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntryInfo {
    pub key: String,
    pub updated: Timestamp,
    pub author: AiId,
}

/// Base64 (de)serialization for ciphertext bytes in JSON surfaces.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_key_validation() {
        assert!(is_valid_vault_key("api.token_prod-1"));
        assert!(!is_valid_vault_key(""));
        assert!(!is_valid_vault_key("bad key"));
        assert!(!is_valid_vault_key("slash/key"));
    }
}
