// SPDX-License-Identifier: MIT OR Apache-2.0
//! HMAC-SHA256 signing for persisted policy files.
//!
//! Grant and sharing files carry an `_hmac_signature` field computed over
//! the canonical form of the payload with every `_hmac*` key excluded.
//! Verification is constant-time.

use crate::canonical::canonical_json;
use crate::error::KernelError;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::path::Path;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix identifying signature bookkeeping keys inside a signed payload.
pub const SIGNATURE_KEY_PREFIX: &str = "_hmac";

/// Compute the hex HMAC-SHA256 of a JSON object, excluding `_hmac*` keys.
pub fn compute_data_hmac(key: &[u8], data: &Map<String, Value>) -> String {
    let filtered: Map<String, Value> = data
        .iter()
        .filter(|(k, _)| !k.starts_with(SIGNATURE_KEY_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let payload = canonical_json(&Value::Object(filtered));

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let tag = mac.finalize().into_bytes();
    let mut out = String::with_capacity(64);
    for byte in tag {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Verify a stored signature against the payload in constant time.
pub fn verify_data_hmac(key: &[u8], data: &Map<String, Value>, expected: &str) -> bool {
    let computed = compute_data_hmac(key, data);
    computed.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Load the signing key from `env_var` if set, otherwise from `key_path`,
/// generating and persisting a fresh 32-byte key (mode 0600) on first use.
pub fn generate_or_load_signing_key(
    key_path: &Path,
    env_var: Option<&str>,
) -> Result<Vec<u8>, KernelError> {
    if let Some(var) = env_var {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Ok(value.into_bytes());
            }
        }
    }

    if key_path.exists() {
        let raw = std::fs::read_to_string(key_path)?;
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.as_bytes().to_vec());
        }
    }

    let key = generate_key_hex();
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    crate::paths::atomic_write(key_path, key.as_bytes(), 0o600)?;
    tracing::info!(path = %key_path.display(), "generated new HMAC signing key");
    Ok(key.into_bytes())
}

/// 32 random bytes, hex-encoded, as the on-disk key material.
fn generate_key_hex() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
