// SPDX-License-Identifier: MIT OR Apache-2.0
//! At-rest encryption backend.
//!
//! Values are AES-256-GCM sealed and stored as `ENC1:` + base64(nonce ‖
//! ciphertext). The prefix is the encrypted-value discriminator: anything
//! without it is legacy plaintext and subject to the fallback policy.
//!
//! Key material is raw 32 bytes, base64-encoded at rest. Loading priority:
//! environment override → key file → freshly generated (persisted 0600).

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rumi_core::KernelError;
use std::path::Path;

/// Prefix marking an encrypted stored value.
pub const ENCRYPTED_PREFIX: &str = "ENC1:";

const NONCE_LEN: usize = 12;

/// AES-256-GCM backend bound to one key.
pub struct CryptoBackend {
    cipher: Aes256Gcm,
}

impl CryptoBackend {
    /// Build a backend from `key_override` (base64) if provided, otherwise
    /// from `key_path`, generating and persisting a key on first use.
    pub fn load(key_path: &Path, key_override: Option<&str>) -> Result<Self, KernelError> {
        let key_bytes = match key_override {
            Some(raw) => decode_key(raw)?,
            None => load_or_generate_key(key_path)?,
        };
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a plaintext into the stored representation.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, KernelError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| KernelError::internal("encryption failed"))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(payload)))
    }

    /// Open a stored value.
    ///
    /// A non-encrypted value is returned as-is when `allow_plaintext`,
    /// otherwise rejected: policy decides whether legacy plaintext is
    /// readable at all.
    pub fn decrypt(&self, stored: &str, allow_plaintext: bool) -> Result<String, KernelError> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            if allow_plaintext {
                tracing::warn!("plaintext fallback used during secret decryption");
                return Ok(stored.to_string());
            }
            return Err(KernelError::internal(
                "value is not encrypted and plaintext fallback is disabled by policy",
            ));
        };

        let payload = BASE64
            .decode(encoded)
            .map_err(|e| KernelError::internal(format!("invalid ciphertext encoding: {e}")))?;
        if payload.len() < NONCE_LEN {
            return Err(KernelError::internal("ciphertext too short"));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| KernelError::internal("decryption failed"))?;
        String::from_utf8(plain).map_err(|e| KernelError::internal(format!("invalid UTF-8: {e}")))
    }

    /// Whether a stored value is in the encrypted representation.
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }
}

fn decode_key(raw: &str) -> Result<[u8; 32], KernelError> {
    let bytes = BASE64
        .decode(raw.trim())
        .map_err(|e| KernelError::internal(format!("invalid secrets key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| KernelError::internal("secrets key must be 32 bytes"))
}

fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], KernelError> {
    if key_path.exists() {
        let raw = std::fs::read_to_string(key_path)?;
        if !raw.trim().is_empty() {
            return decode_key(&raw);
        }
    }

    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    rumi_core::paths::atomic_write(key_path, BASE64.encode(key).as_bytes(), 0o600)?;
    tracing::info!(path = %key_path.display(), "generated new secrets encryption key");
    Ok(key)
}
