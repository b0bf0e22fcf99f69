//! Signed security envelopes.
//!
//! Every record a consumer might need to authenticate carries an envelope:
//! the producing AI id, a purpose tag, a SHA3-256 hash of the canonical
//! payload, and (when the private key is available) an Ed25519 signature
//! over the canonical envelope minus its `signature` and `status` fields.

use crate::{canonical_json, sha3_hex, AiId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Whether an envelope carries a verifiable signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Signature present and produced by the claimed key.
    Signed,
    /// Key material was unavailable; payload hash still usable.
    Unsigned,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Signed => "signed",
            EnvelopeStatus::Unsigned => "unsigned",
        }
    }
}

/// Signed metadata wrapping a payload hash for authenticity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ai_id: AiId,
    /// Purpose tag, e.g. `teambook.http.identity` or `teambook.message`.
    pub purpose: String,
    pub issued_at: Timestamp,
    /// SHA3-256 over the canonical payload, hex-encoded.
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub status: EnvelopeStatus,
}

impl Envelope {
    /// Build an unsigned envelope over `payload`. Signing is layered on by
    /// the identity runtime, which fills `signature` and flips `status`.
    pub fn unsigned(ai_id: AiId, purpose: impl Into<String>, payload: &JsonValue) -> Self {
        Self {
            ai_id,
            purpose: purpose.into(),
            issued_at: chrono::Utc::now(),
            payload_hash: sha3_hex(canonical_json(payload).as_bytes()),
            signature: None,
            status: EnvelopeStatus::Unsigned,
        }
    }

    /// The canonical bytes a signature covers: the envelope rendered with
    /// sorted keys, minus `signature` and `status`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = json!({
            "ai_id": self.ai_id,
            "purpose": self.purpose,
            "issued_at": self.issued_at.to_rfc3339(),
            "payload_hash": self.payload_hash,
        });
        canonical_json(&body).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_envelope_hashes_payload() {
        let payload = json!({"b": 2, "a": 1});
        let env = Envelope::unsigned(AiId::from("alpha-001"), "test", &payload);
        assert_eq!(env.status, EnvelopeStatus::Unsigned);
        assert_eq!(env.payload_hash, sha3_hex(br#"{"a":1,"b":2}"#));
        assert!(env.signature.is_none());
    }

    #[test]
    fn test_signing_bytes_exclude_signature_and_status() {
        let payload = json!({"x": true});
        let mut env = Envelope::unsigned(AiId::from("alpha-001"), "test", &payload);
        let before = env.signing_bytes();
        env.signature = Some("sig".to_string());
        env.status = EnvelopeStatus::Signed;
        assert_eq!(before, env.signing_bytes());
    }
}
