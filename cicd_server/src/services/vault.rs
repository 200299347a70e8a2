//! AES-256-GCM credential vault for stored secrets.
//!
//! The key is derived once per process from a stable deployment identity, so
//! every replica of the same deployment can read what another one wrote.
//! Ciphertext layout: `base64(nonce || sealed)`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CicdError, Result};

const NONCE_LEN: usize = 12;

/// Identity used when nothing better is configured.
pub const FALLBACK_IDENTITY: &str = "opsdeck-cicd-default-deployment";

/// Where the vault key comes from, most specific first.
#[derive(Debug, Clone, Default)]
pub struct KeySource {
    /// Operator-supplied key. 64 hex chars are used as raw key bytes, anything
    /// else is hashed.
    pub explicit_key: Option<String>,
    /// Orchestrator-provided namespace identity.
    pub namespace_identity: Option<String>,
    pub storage_path: Option<String>,
}

pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(source: &KeySource) -> Self {
        if let Some(key) = source.explicit_key.as_deref().filter(|k| !k.is_empty()) {
            if let Ok(bytes) = hex::decode(key) {
                if bytes.len() == 32 {
                    tracing::info!("Credential vault using explicit key");
                    return Self::from_key_bytes(&bytes);
                }
            }
            tracing::info!("Credential vault deriving key from explicit passphrase");
            return Self::from_identity(key);
        }

        let (identity, origin) = match (
            source.namespace_identity.as_deref().filter(|s| !s.is_empty()),
            source.storage_path.as_deref().filter(|s| !s.is_empty()),
        ) {
            (Some(ns), _) => (ns, "namespace identity"),
            (None, Some(path)) => (path, "storage path"),
            (None, None) => (FALLBACK_IDENTITY, "built-in default"),
        };
        if origin == "built-in default" {
            tracing::warn!("Credential vault key derived from built-in default identity");
        } else {
            tracing::info!(origin, "Credential vault key derived from deployment identity");
        }
        Self::from_identity(identity)
    }

    /// Key = SHA-256(identity).
    pub fn from_identity(identity: &str) -> Self {
        let digest = Sha256::digest(identity.as_bytes());
        Self::from_key_bytes(&digest)
    }

    fn from_key_bytes(key: &[u8]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypt a secret. Empty input yields empty output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| CicdError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Exact inverse of [`encrypt`](Self::encrypt). Fails closed on tampering.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let data = BASE64
            .decode(encoded)
            .map_err(|e| CicdError::Crypto(format!("invalid ciphertext encoding: {e}")))?;
        if data.len() < NONCE_LEN {
            return Err(CicdError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|e| CicdError::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plain).map_err(|e| CicdError::Crypto(format!("plaintext is not UTF-8: {e}")))
    }

    /// Encrypt an optional replacement. `None` keeps `current` ciphertext as is.
    pub fn reseal(&self, current: &str, replacement: Option<&str>) -> Result<String> {
        match replacement {
            Some(plain) => self.encrypt(plain),
            None => Ok(current.to_string()),
        }
    }
}
