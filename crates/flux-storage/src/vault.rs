//! The secrets vault (spec.md §4.4): ciphertext-only storage behind the
//! `Repository`, encrypted with an AEAD construction keyed by a master
//! key supplied out of band. Generalized from the teacher's
//! `everruns-storage::encryption::EncryptionService` (envelope
//! AES-256-GCM with versioned keys for rotation).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::StoreError;
use crate::repository::Repository;

const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid master key: {0}")]
    InvalidKey(String),
    #[error("decryption failed (wrong key or corrupt ciphertext)")]
    DecryptionFailed,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedSecret {
    key_id: String,
    nonce: String,
    ciphertext: String,
}

struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// AEAD envelope over named plaintext secrets. Listing reveals names,
/// never values (spec.md §4.4).
pub struct SecretsVault<R: Repository> {
    repo: Arc<R>,
    primary: VersionedKey,
    all_keys: HashMap<String, Aes256Gcm>,
}

impl<R: Repository> SecretsVault<R> {
    /// `primary_key` and `previous_keys` are `"key_id:base64_key"`
    /// strings; the primary key encrypts new secrets, all keys are
    /// tried on decrypt so rotation can proceed without re-encrypting
    /// every secret up front.
    pub fn new(repo: Arc<R>, primary_key: &str, previous_keys: &[&str]) -> Result<Self, VaultError> {
        let (primary_id, primary_cipher) = parse_versioned_key(primary_key)?;
        let mut all_keys = HashMap::new();
        all_keys.insert(primary_id.clone(), primary_cipher.clone());
        for raw in previous_keys {
            let (id, cipher) = parse_versioned_key(raw)?;
            all_keys.insert(id, cipher);
        }
        Ok(Self {
            repo,
            primary: VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            },
            all_keys,
        })
    }

    pub async fn set(&self, name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .primary
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        let sealed = SealedSecret {
            key_id: self.primary.id.clone(),
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        };
        let bytes = serde_json::to_vec(&sealed)?;
        self.repo.put_secret(name, bytes).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Vec<u8>, VaultError> {
        let raw = self.repo.get_secret(name).await?;
        let sealed: SealedSecret = serde_json::from_slice(&raw)?;
        let cipher = self
            .all_keys
            .get(&sealed.key_id)
            .ok_or_else(|| VaultError::InvalidKey(sealed.key_id.clone()))?;
        let nonce_bytes = STANDARD
            .decode(&sealed.nonce)
            .map_err(|_| VaultError::DecryptionFailed)?;
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| VaultError::DecryptionFailed)
    }

    pub async fn list(&self) -> Result<Vec<String>, VaultError> {
        Ok(self.repo.list_secret_names().await?)
    }

    pub async fn remove(&self, name: &str) -> Result<(), VaultError> {
        self.repo.remove_secret(name).await?;
        Ok(())
    }
}

fn parse_versioned_key(raw: &str) -> Result<(String, Aes256Gcm), VaultError> {
    let (id, b64) = raw
        .split_once(':')
        .ok_or_else(|| VaultError::InvalidKey("expected \"key_id:base64_key\"".into()))?;
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(VaultError::InvalidKey("key must be 32 bytes".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(&bytes)
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    Ok((id.to_string(), cipher))
}

/// Generate a fresh `"key_id:base64_key"` string suitable for
/// `FLUX_SECURITY__ENCRYPTION_KEY`.
pub fn generate_encryption_key(key_id: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{key_id}:{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;

    #[tokio::test]
    async fn round_trips_a_secret() {
        let repo = Arc::new(InMemoryRepository::new());
        let key = generate_encryption_key("v1");
        let vault = SecretsVault::new(repo, &key, &[]).unwrap();

        vault.set("api_key", b"sk-super-secret").await.unwrap();
        let got = vault.get("api_key").await.unwrap();
        assert_eq!(got, b"sk-super-secret");

        let names = vault.list().await.unwrap();
        assert_eq!(names, vec!["api_key".to_string()]);
    }

    #[tokio::test]
    async fn decrypts_with_rotated_previous_key() {
        let repo = Arc::new(InMemoryRepository::new());
        let old_key = generate_encryption_key("v1");
        let vault_old = SecretsVault::new(repo.clone(), &old_key, &[]).unwrap();
        vault_old.set("token", b"value").await.unwrap();

        let new_key = generate_encryption_key("v2");
        let vault_new = SecretsVault::new(repo, &new_key, &[&old_key]).unwrap();
        let got = vault_new.get("token").await.unwrap();
        assert_eq!(got, b"value");
    }

    #[tokio::test]
    async fn remove_deletes_secret() {
        let repo = Arc::new(InMemoryRepository::new());
        let key = generate_encryption_key("v1");
        let vault = SecretsVault::new(repo, &key, &[]).unwrap();
        vault.set("x", b"1").await.unwrap();
        vault.remove("x").await.unwrap();
        assert!(vault.get("x").await.is_err());
    }
}
