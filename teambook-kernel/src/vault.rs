//! Per-teambook encrypted key/value storage.
//!
//! A symmetric ChaCha20-Poly1305 key lives at `<root>/<name>/.vault_key`
//! with owner-only permissions, created with exclusive-create semantics so
//! two racing processes settle on one key. Values are stored as
//! nonce || ciphertext; `vault_list` never exposes plaintext.

use crate::{Kernel, KernelResponse};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use teambook_core::{
    is_valid_vault_key, ErrorCode, TeambookError, TeambookResult, VaultItem,
};
use teambook_storage::StorageBackend;
use tracing::debug;

const NONCE_LEN: usize = 12;

/// Cipher bound to one teambook's key file.
pub struct VaultCrypto {
    cipher: ChaCha20Poly1305,
}

impl VaultCrypto {
    /// Load or atomically create the vault key.
    pub fn open(key_file: &Path) -> TeambookResult<Self> {
        let key_bytes = load_or_create_key(key_file)
            .map_err(|e| TeambookError::new(ErrorCode::EncryptionError, e.to_string()))?;
        let key = Key::from_slice(&key_bytes);
        Ok(Self {
            cipher: ChaCha20Poly1305::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> TeambookResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| TeambookError::new(ErrorCode::EncryptionError, e.to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, stored: &[u8]) -> TeambookResult<String> {
        if stored.len() <= NONCE_LEN {
            return Err(TeambookError::new(
                ErrorCode::EncryptionError,
                "ciphertext too short",
            ));
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| TeambookError::new(ErrorCode::EncryptionError, e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| TeambookError::new(ErrorCode::EncryptionError, e.to_string()))
    }
}

/// Exclusive-create avoids the race where two processes both generate a
/// key: the loser reads the winner's file.
fn load_or_create_key(path: &Path) -> std::io::Result<[u8; 32]> {
    if let Ok(raw) = std::fs::read(path) {
        if let Ok(key) = <[u8; 32]>::try_from(raw.as_slice()) {
            return Ok(key);
        }
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let key: [u8; 32] = rand::random();
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(mut file) => {
            file.write_all(&key)?;
            Ok(key)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let raw = std::fs::read(path)?;
            <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "vault key corrupted")
            })
        }
        Err(err) => Err(err),
    }
}

// ============================================================================
// KERNEL VERBS
// ============================================================================

impl Kernel {
    pub async fn vault_set(&self, key: &str, value: &str) -> TeambookResult<KernelResponse> {
        self.validate_vault_key(key)?;
        let teambook = self.current_teambook();
        let crypto = self.vault_for(&teambook)?;
        let now = Utc::now();
        let item = VaultItem {
            key: key.to_string(),
            encrypted_value: crypto.encrypt(value)?,
            created: now,
            updated: now,
            author: self.ai_id().clone(),
        };
        self.store.vault_set(&teambook, &item).await?;
        debug!(key, teambook = %teambook, "vault entry stored");
        Ok(KernelResponse::ok("stored", json!({"key": key})))
    }

    pub async fn vault_get(&self, key: &str) -> TeambookResult<KernelResponse> {
        self.validate_vault_key(key)?;
        let teambook = self.current_teambook();
        let Some(item) = self.store.vault_get(&teambook, key).await? else {
            return Err(TeambookError::new(
                ErrorCode::InvalidItem,
                format!("no vault entry '{}'", key),
            ));
        };
        let crypto = self.vault_for(&teambook)?;
        let value = crypto.decrypt(&item.encrypted_value)?;
        Ok(KernelResponse::ok(
            "decrypted",
            json!({"key": key, "value": value}),
        ))
    }

    pub async fn vault_delete(&self, key: &str) -> TeambookResult<KernelResponse> {
        self.validate_vault_key(key)?;
        let teambook = self.current_teambook();
        let removed = self.store.vault_delete(&teambook, key).await?;
        Ok(KernelResponse::ok(
            if removed { "deleted" } else { "absent" },
            json!({"key": key, "deleted": removed}),
        ))
    }

    pub async fn vault_list(&self) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let entries = self.store.vault_list(&teambook).await?;
        let listing: Vec<_> = entries
            .iter()
            .map(|entry| {
                json!({
                    "key": entry.key,
                    "updated": entry.updated.to_rfc3339(),
                    "author": entry.author,
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} entries", listing.len()),
            json!({"entries": listing}),
        ))
    }

    fn validate_vault_key(&self, key: &str) -> TeambookResult<()> {
        if is_valid_vault_key(key) {
            Ok(())
        } else {
            Err(TeambookError::new(
                ErrorCode::InvalidItem,
                "vault keys are alphanumeric plus '._-'",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let crypto = VaultCrypto::open(&dir.path().join(".vault_key")).expect("open");
        let stored = crypto.encrypt("secret value").expect("encrypt");
        assert_ne!(stored, b"secret value");
        assert_eq!(crypto.decrypt(&stored).expect("decrypt"), "secret value");
    }

    #[test]
    fn test_key_reused_across_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_file = dir.path().join(".vault_key");
        let first = VaultCrypto::open(&key_file).expect("open");
        let stored = first.encrypt("v").expect("encrypt");
        let second = VaultCrypto::open(&key_file).expect("reopen");
        assert_eq!(second.decrypt(&stored).expect("decrypt"), "v");
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let crypto = VaultCrypto::open(&dir.path().join(".vault_key")).expect("open");
        assert!(crypto.decrypt(&[0u8; 5]).is_err());
    }
}
