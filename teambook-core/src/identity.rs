//! Identity types for Teambook AI instances.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

// ============================================================================
// RECORD ID TYPE SYSTEM
// ============================================================================

/// Trait for type-safe numeric record IDs.
///
/// Teambook records carry monotonically increasing integer IDs allocated by
/// the storage backend. Each record type gets its own newtype so IDs cannot
/// be accidentally mixed up at compile time.
pub trait RecordIdType:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Ord
    + Hash
    + fmt::Debug
    + fmt::Display
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The name of the record type (e.g., "note", "task").
    const RECORD_NAME: &'static str;

    /// Wrap a raw ID.
    fn new(raw: i64) -> Self;

    /// Get the underlying integer.
    fn as_i64(&self) -> i64;
}

/// Macro to define a type-safe record ID newtype over `i64`.
macro_rules! define_record_id {
    ($name:ident, $record:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl RecordIdType for $name {
            const RECORD_NAME: &'static str = $record;

            fn new(raw: i64) -> Self {
                Self(raw)
            }

            fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

define_record_id!(NoteId, "note", "Type-safe ID for note records.");
define_record_id!(MessageId, "message", "Type-safe ID for message records.");
define_record_id!(TaskId, "task", "Type-safe ID for task records.");
define_record_id!(EventId, "event", "Type-safe ID for event records.");
define_record_id!(SessionId, "session", "Type-safe ID for authoring sessions.");
define_record_id!(EntityId, "entity", "Type-safe ID for extracted entities.");
define_record_id!(FactId, "fact", "Type-safe ID for entity facts.");
define_record_id!(
    ContributionId,
    "contribution",
    "Type-safe ID for evolution contributions."
);

// ============================================================================
// AI IDENTITY
// ============================================================================

/// Stable identifier for an AI instance: `<slug>-<3 digit suffix>`.
///
/// The suffix is derived from the instance public key (see
/// [`derive_ai_suffix`]), so the same keypair always maps to the same id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AiId(String);

impl AiId {
    /// Wrap a raw id string without validation (storage layer use).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build an id from a display-name slug and a numeric suffix.
    pub fn from_parts(slug: &str, suffix: u32) -> Self {
        Self(format!("{}-{:03}", slug, suffix % 1000))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AiId({})", self.0)
    }
}

impl fmt::Display for AiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AiId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for AiId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Slugify a display name: lowercase, alphanumerics kept, runs of anything
/// else collapsed to a single dash.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "ai".to_string()
    } else {
        trimmed
    }
}

/// Derive the 3-digit id suffix from a raw Ed25519 public key.
///
/// `suffix = u24(SHA3-256(pk)[0..3]) mod 1000`.
pub fn derive_ai_suffix(public_key: &[u8]) -> u32 {
    let digest = Sha3_256::digest(public_key);
    let n = ((digest[0] as u32) << 16) | ((digest[1] as u32) << 8) | (digest[2] as u32);
    n % 1000
}

/// Derive the key fingerprint: first 16 hex chars of SHA3-256 of the raw
/// public key bytes.
pub fn derive_fingerprint(public_key: &[u8]) -> String {
    let digest = Sha3_256::digest(public_key);
    hex::encode(digest)[..16].to_string()
}

/// Persisted identity metadata for one AI instance.
///
/// Written to `ai_identity.json` (owner-only permissions) beside the private
/// key. The fingerprint is immutable; the display name may be refreshed from
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiIdentity {
    pub ai_id: AiId,
    pub display_name: String,
    /// First 16 hex chars of SHA3-256 over the raw public key.
    pub fingerprint: String,
    /// Base64-encoded Ed25519 public key.
    pub public_key: String,
    /// Protocol-specific handles (pretty, slug, mcp, http, cli, ...).
    #[serde(default)]
    pub handles: BTreeMap<String, String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// HANDLE RESOLUTION
// ============================================================================

/// Constraints a protocol places on handles, used by handle resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleCapabilities {
    /// Regex the resolved handle must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_spaces: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_unicode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefer_ascii: Option<bool>,
}

impl HandleCapabilities {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
            && self.max_length.is_none()
            && self.supports_spaces.is_none()
            && self.supports_unicode.is_none()
            && self.prefer_ascii.is_none()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_type_safety() {
        let note_id = NoteId::new(1);
        let task_id = TaskId::new(1);
        // This would not compile if uncommented:
        // let _: NoteId = task_id;
        assert_eq!(note_id.as_i64(), task_id.as_i64());
    }

    #[test]
    fn test_record_id_serde_transparent() {
        let id = NoteId::new(42);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "42");
        let back: NoteId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alpha One"), "alpha-one");
        assert_eq!(slugify("  --Beta__2!  "), "beta-2");
        assert_eq!(slugify("日本"), "ai");
    }

    #[test]
    fn test_ai_id_from_parts_pads_suffix() {
        let id = AiId::from_parts("alpha", 7);
        assert_eq!(id.as_str(), "alpha-007");
        let id = AiId::from_parts("alpha", 1234);
        assert_eq!(id.as_str(), "alpha-234");
    }

    #[test]
    fn test_suffix_and_fingerprint_deterministic() {
        let pk = [7u8; 32];
        assert_eq!(derive_ai_suffix(&pk), derive_ai_suffix(&pk));
        let fp = derive_fingerprint(&pk);
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, derive_fingerprint(&pk));
    }

    #[test]
    fn test_suffix_range() {
        for seed in 0u8..16 {
            let pk = [seed; 32];
            assert!(derive_ai_suffix(&pk) < 1000);
        }
    }
}
