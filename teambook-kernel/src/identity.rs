//! Per-AI identity: Ed25519 keypair, signed envelopes, handle resolution.
//!
//! Identity metadata lives in `ai_identity.json` beside the private key,
//! both owner-only. Key persistence failures degrade to unsigned envelopes;
//! they never abort the operation that asked for a signature.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use teambook_core::{
    derive_ai_suffix, derive_fingerprint, slugify, AiId, AiIdentity, Envelope, EnvelopeStatus,
    HandleCapabilities, TeambookConfig,
};
use tracing::{debug, warn};

const IDENTITY_FILE: &str = "ai_identity.json";
const KEY_FILE: &str = "ai_identity.key";
const REGISTRY_FILE: &str = "identity_registry.json";
const DEFAULT_DISPLAY_NAME: &str = "Teambook AI";

/// Loaded identity plus the cached private key.
pub struct SigningIdentity {
    identity: AiIdentity,
    signing_key: Option<SigningKey>,
    registry_path: PathBuf,
}

impl SigningIdentity {
    /// Load identity metadata from the canonical location, generating a
    /// fresh keypair on first run. Directory-creation failures fall back to
    /// a temp directory; key failures degrade to unsigned operation.
    pub fn load_or_create(config: &TeambookConfig) -> Self {
        let dir = identity_dir(config);
        let registry_path = config
            .identity_registry
            .clone()
            .unwrap_or_else(|| dir.join(REGISTRY_FILE));

        // AI_IDENTITY_FILE pins the metadata file directly; the key lives
        // beside whichever file wins.
        let identity_path = config
            .identity_file
            .clone()
            .unwrap_or_else(|| dir.join(IDENTITY_FILE));
        let key_path = identity_path.with_file_name(KEY_FILE);

        let mut signing_key = load_key(&key_path);
        let mut identity = load_metadata(&identity_path);

        if identity.is_none() || signing_key.is_none() {
            let key = signing_key.unwrap_or_else(|| {
                let key = SigningKey::generate(&mut rand::rngs::OsRng);
                if let Err(err) = persist_key(&key_path, &key) {
                    warn!(error = %err, "could not persist private key, envelopes will be unsigned");
                }
                key
            });
            let fresh = build_identity(config, &key);
            if let Err(err) = persist_metadata(&identity_path, &fresh) {
                warn!(error = %err, "could not persist identity metadata");
            }
            identity = Some(fresh);
            signing_key = Some(key);
        }

        let mut identity = identity.expect("identity populated above");
        // Display name may be refreshed from configuration; the id and
        // fingerprint stay pinned to the key.
        if let Some(name) = &config.display_name {
            if *name != identity.display_name {
                identity.display_name = name.clone();
                identity.handles.insert("pretty".to_string(), name.clone());
                identity.updated_at = Utc::now();
                let _ = persist_metadata(&identity_path, &identity);
            }
        }

        let me = Self {
            identity,
            signing_key,
            registry_path,
        };
        me.register();
        me
    }

    pub fn ai_id(&self) -> &AiId {
        &self.identity.ai_id
    }

    pub fn identity(&self) -> &AiIdentity {
        &self.identity
    }

    /// Sign raw bytes with the cached key, base64-encoded. `None` when the
    /// key could not be loaded.
    pub fn sign(&self, bytes: &[u8]) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        Some(B64.encode(key.sign(bytes).to_bytes()))
    }

    /// Verify a peer's signature against its published public key.
    pub fn verify(pk_b64: &str, bytes: &[u8], sig_b64: &str) -> bool {
        let Ok(pk_raw) = B64.decode(pk_b64) else {
            return false;
        };
        let Ok(pk_arr) = <[u8; 32]>::try_from(pk_raw.as_slice()) else {
            return false;
        };
        let Ok(verifying) = VerifyingKey::from_bytes(&pk_arr) else {
            return false;
        };
        let Ok(sig_raw) = B64.decode(sig_b64) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; 64]>::try_from(sig_raw.as_slice()) else {
            return false;
        };
        verifying.verify(bytes, &Signature::from_bytes(&sig_arr)).is_ok()
    }

    /// Build a signed (or, without a key, unsigned) envelope over a payload.
    pub fn build_envelope(&self, payload: &JsonValue, purpose: &str) -> Envelope {
        let mut envelope = Envelope::unsigned(self.identity.ai_id.clone(), purpose, payload);
        if let Some(signature) = self.sign(&envelope.signing_bytes()) {
            envelope.signature = Some(signature);
            envelope.status = EnvelopeStatus::Signed;
        }
        envelope
    }

    /// Choose the best handle for a protocol, subject to its constraints.
    ///
    /// Candidates in preference order: the pretty display name (when
    /// `prefer_pretty`), the protocol-specific handle, the slug, the ai_id.
    /// The first candidate satisfying every constraint wins; the ai_id is
    /// the unconditional fallback.
    pub fn resolve_handle(
        &self,
        protocol: Option<&str>,
        capabilities: &HandleCapabilities,
        prefer_pretty: bool,
    ) -> String {
        let mut candidates: Vec<String> = Vec::new();
        if prefer_pretty {
            candidates.push(self.identity.display_name.clone());
        }
        if let Some(protocol) = protocol {
            if let Some(handle) = self.identity.handles.get(&protocol.to_ascii_lowercase()) {
                candidates.push(handle.clone());
            }
        }
        if let Some(slug) = self.identity.handles.get("slug") {
            candidates.push(slug.clone());
        }
        if !prefer_pretty {
            candidates.push(self.identity.display_name.clone());
        }
        candidates.push(self.identity.ai_id.as_str().to_string());

        for candidate in &candidates {
            if handle_fits(candidate, capabilities) {
                return candidate.clone();
            }
        }
        self.identity.ai_id.as_str().to_string()
    }

    /// Upsert this identity into the shared registry via atomic replace.
    /// The registry never deletes entries, only refreshes `updated_at`.
    fn register(&self) {
        let mut registry: BTreeMap<String, AiIdentity> = std::fs::read(&self.registry_path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();

        let mut entry = self.identity.clone();
        entry.updated_at = Utc::now();
        registry.insert(entry.ai_id.as_str().to_string(), entry);

        if let Err(err) = atomic_write_json(&self.registry_path, &registry) {
            debug!(error = %err, "identity registry update failed");
        }
    }
}

fn handle_fits(candidate: &str, caps: &HandleCapabilities) -> bool {
    if candidate.is_empty() {
        return false;
    }
    if let Some(max) = caps.max_length {
        if candidate.chars().count() > max {
            return false;
        }
    }
    if caps.supports_spaces == Some(false) && candidate.contains(' ') {
        return false;
    }
    let ascii_only = caps.supports_unicode == Some(false) || caps.prefer_ascii == Some(true);
    if ascii_only && !candidate.is_ascii() {
        return false;
    }
    if let Some(pattern) = &caps.pattern {
        match regex::Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(candidate) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

fn identity_dir(config: &TeambookConfig) -> PathBuf {
    let preferred = config
        .identity_dir
        .clone()
        .unwrap_or_else(|| config.root.join("identity"));
    if std::fs::create_dir_all(&preferred).is_ok() {
        return preferred;
    }
    let fallback = std::env::temp_dir().join("teambook-identity");
    let _ = std::fs::create_dir_all(&fallback);
    warn!(
        preferred = %preferred.display(),
        fallback = %fallback.display(),
        "identity directory not writable, using temp fallback"
    );
    fallback
}

fn build_identity(config: &TeambookConfig, key: &SigningKey) -> AiIdentity {
    let pk = key.verifying_key().to_bytes();
    let display_name = config
        .display_name
        .clone()
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
    let slug = slugify(&display_name);
    let ai_id = match &config.ai_id_override {
        Some(id) => AiId::new(id.clone()),
        None => AiId::from_parts(&slug, derive_ai_suffix(&pk)),
    };

    let mut handles = BTreeMap::new();
    handles.insert("pretty".to_string(), display_name.clone());
    handles.insert("slug".to_string(), slug);
    for protocol in ["mcp", "http", "cli"] {
        handles.insert(protocol.to_string(), ai_id.as_str().to_string());
    }

    let now = Utc::now();
    AiIdentity {
        ai_id,
        display_name,
        fingerprint: derive_fingerprint(&pk),
        public_key: B64.encode(pk),
        handles,
        created_at: now,
        updated_at: now,
    }
}

fn load_metadata(path: &Path) -> Option<AiIdentity> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn load_key(path: &Path) -> Option<SigningKey> {
    let raw = std::fs::read_to_string(path).ok()?;
    let bytes = B64.decode(raw.trim()).ok()?;
    let arr = <[u8; 32]>::try_from(bytes.as_slice()).ok()?;
    Some(SigningKey::from_bytes(&arr))
}

fn persist_key(path: &Path, key: &SigningKey) -> std::io::Result<()> {
    std::fs::write(path, B64.encode(key.to_bytes()))?;
    restrict_permissions(path)
}

fn persist_metadata(path: &Path, identity: &AiIdentity) -> std::io::Result<()> {
    atomic_write_json(path, identity)?;
    restrict_permissions(path)
}

/// Write-then-rename so concurrent readers never observe a torn file.
fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_in(dir: &Path) -> TeambookConfig {
        TeambookConfig {
            root: dir.to_path_buf(),
            identity_dir: Some(dir.join("identity")),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_stable_across_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let first = SigningIdentity::load_or_create(&config);
        let second = SigningIdentity::load_or_create(&config);
        assert_eq!(first.ai_id(), second.ai_id());
        assert_eq!(first.identity().fingerprint, second.identity().fingerprint);
        assert_eq!(first.identity().public_key, second.identity().public_key);
    }

    #[test]
    fn test_ai_id_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = SigningIdentity::load_or_create(&config_in(dir.path()));
        let id = identity.ai_id().as_str();
        let (slug, suffix) = id.rsplit_once('-').expect("slug-suffix form");
        assert!(!slug.is_empty());
        assert_eq!(suffix.len(), 3);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_fingerprint_matches_public_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = SigningIdentity::load_or_create(&config_in(dir.path()));
        let pk = B64.decode(&identity.identity().public_key).expect("b64");
        assert_eq!(identity.identity().fingerprint, derive_fingerprint(&pk));
    }

    #[test]
    fn test_envelope_signs_and_verifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = SigningIdentity::load_or_create(&config_in(dir.path()));
        let payload = json!({"hello": "world"});
        let envelope = identity.build_envelope(&payload, "test.purpose");
        assert_eq!(envelope.status, EnvelopeStatus::Signed);
        let signature = envelope.signature.clone().expect("signature");
        assert!(SigningIdentity::verify(
            &identity.identity().public_key,
            &envelope.signing_bytes(),
            &signature,
        ));
        // A different payload hash breaks verification.
        let mut forged = envelope.clone();
        forged.payload_hash = "00".repeat(32);
        assert!(!SigningIdentity::verify(
            &identity.identity().public_key,
            &forged.signing_bytes(),
            &signature,
        ));
    }

    #[test]
    fn test_handle_resolution_constraints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TeambookConfig {
            display_name: Some("Alpha One".to_string()),
            ..config_in(dir.path())
        };
        let identity = SigningIdentity::load_or_create(&config);

        // Pretty preferred and allowed.
        let caps = HandleCapabilities::default();
        assert_eq!(identity.resolve_handle(None, &caps, true), "Alpha One");

        // Spaces forbidden pushes resolution down to the slug.
        let caps = HandleCapabilities {
            supports_spaces: Some(false),
            ..Default::default()
        };
        assert_eq!(identity.resolve_handle(None, &caps, true), "alpha-one");

        // A pattern nothing matches falls back to the ai_id.
        let caps = HandleCapabilities {
            pattern: Some("^zzz$".to_string()),
            ..Default::default()
        };
        assert_eq!(
            identity.resolve_handle(None, &caps, true),
            identity.ai_id().as_str()
        );
    }

    #[test]
    fn test_registry_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let identity = SigningIdentity::load_or_create(&config);
        let registry_path = dir.path().join("identity").join(REGISTRY_FILE);
        let raw = std::fs::read(&registry_path).expect("registry written");
        let registry: BTreeMap<String, AiIdentity> =
            serde_json::from_slice(&raw).expect("valid registry");
        assert!(registry.contains_key(identity.ai_id().as_str()));
    }
}
