// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-secrets
//!
//! Secrets live one file per key under `user_data/secrets/<KEY>.json`,
//! encrypted at rest. The public surface is list / set / delete / has —
//! nothing here ever returns a stored value to an API caller. The single
//! internal read path exists for the grant-backed `secrets.get` capability
//! and records its caller in the audit journal.
//!
//! Deletion is a tombstone: the value is emptied and `deleted_at` set, so
//! a key's history stays observable in `list_keys`.

#![deny(unsafe_code)]

pub mod crypto;

pub use crypto::{CryptoBackend, ENCRYPTED_PREFIX};

use rumi_audit::AuditLogger;
use rumi_core::config::{PlaintextPolicy, SecurityMode};
use rumi_core::{now_ts, ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MIGRATION_MARKER_FILE: &str = ".migration_complete";
const JOURNAL_FILE: &str = "journal.jsonl";

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    key: String,
    value: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

/// Metadata returned by `list_keys` — never the value.
#[derive(Debug, Clone, Serialize)]
pub struct SecretMeta {
    pub key: String,
    pub exists: bool,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

/// Result of `set_secret`.
#[derive(Debug, Clone, Serialize)]
pub struct SecretSetResult {
    pub key: String,
    pub created: bool,
}

// ---------------------------------------------------------------------------
// SecretsStore
// ---------------------------------------------------------------------------

/// Per-key encrypted secret files with tombstone deletion and a
/// plaintext-migration path.
pub struct SecretsStore {
    secrets_dir: PathBuf,
    crypto: CryptoBackend,
    policy: PlaintextPolicy,
    security_mode: SecurityMode,
    audit: Arc<AuditLogger>,
    lock: Mutex<()>,
}

impl SecretsStore {
    /// Open (or initialise) the store.
    ///
    /// `key_path` is where the encryption key lives when no override is
    /// given. On startup under the `auto` policy, a full scan decides
    /// whether the migration-complete marker can be written immediately.
    pub fn new(
        secrets_dir: impl Into<PathBuf>,
        key_path: &Path,
        key_override: Option<&str>,
        policy: PlaintextPolicy,
        security_mode: SecurityMode,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, KernelError> {
        let secrets_dir = secrets_dir.into();
        std::fs::create_dir_all(&secrets_dir)?;
        let store = Self {
            crypto: CryptoBackend::load(key_path, key_override)?,
            secrets_dir,
            policy,
            security_mode,
            audit,
            lock: Mutex::new(()),
        };
        store.init_migration_marker();
        Ok(store)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.secrets_dir.join(format!("{key}.json"))
    }

    fn marker_path(&self) -> PathBuf {
        self.secrets_dir.join(MIGRATION_MARKER_FILE)
    }

    // -- Plaintext fallback policy --------------------------------------

    fn has_migration_marker(&self) -> bool {
        self.marker_path().exists()
    }

    fn write_migration_marker(&self) {
        let body = json!({
            "completed_at": now_ts(),
            "note": "All secrets migrated to encrypted storage.",
        });
        if let Err(e) = rumi_core::paths::atomic_write_json(&self.marker_path(), &body, 0o600) {
            tracing::warn!(error = %e, "failed to write migration marker");
        }
    }

    fn all_encrypted(&self) -> bool {
        let Ok(read_dir) = std::fs::read_dir(&self.secrets_dir) else {
            return true;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(file) = read_secret_file(&path) else {
                continue;
            };
            if file.deleted_at.is_some() {
                continue;
            }
            if !file.value.is_empty() && !CryptoBackend::is_encrypted(&file.value) {
                return false;
            }
        }
        true
    }

    fn init_migration_marker(&self) {
        if self.policy != PlaintextPolicy::Auto || self.has_migration_marker() {
            return;
        }
        if self.all_encrypted() {
            self.write_migration_marker();
        }
    }

    fn plaintext_allowed(&self) -> bool {
        match self.policy {
            PlaintextPolicy::Always => true,
            PlaintextPolicy::Never => false,
            PlaintextPolicy::Auto => match self.security_mode {
                SecurityMode::Strict => false,
                SecurityMode::Permissive => !self.has_migration_marker(),
            },
        }
    }

    // -- Public API ------------------------------------------------------

    /// Write (or overwrite) a secret. Returns whether the key was created.
    pub fn set_secret(
        &self,
        key: &str,
        value: &str,
        actor: &str,
    ) -> Result<SecretSetResult, KernelError> {
        if !valid_key(key) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "key must match ^[A-Z0-9_]{1,64}$",
            ));
        }

        let _guard = self.lock.lock().expect("secrets lock");
        let path = self.key_path(key);
        let existing = read_secret_file(&path).ok();
        // A tombstoned key counts as created again.
        let created = match &existing {
            Some(file) => file.deleted_at.is_some(),
            None => true,
        };

        let now = now_ts();
        let file = SecretFile {
            key: key.to_string(),
            value: self.crypto.encrypt(value)?,
            created_at: match (&existing, created) {
                (Some(old), false) => old.created_at.clone(),
                _ => now.clone(),
            },
            updated_at: now,
            deleted_at: None,
        };
        rumi_core::paths::atomic_write_json(&path, &file, 0o600)?;

        self.append_journal("set", key, actor);
        self.audit.log_system_event(
            "secret_set",
            true,
            details(&[("key", json!(key)), ("created", json!(created)), ("actor", json!(actor))]),
            None,
        );
        Ok(SecretSetResult {
            key: key.to_string(),
            created,
        })
    }

    /// Tombstone a secret: value emptied, `deleted_at` set.
    pub fn delete_secret(&self, key: &str, actor: &str) -> Result<(), KernelError> {
        if !valid_key(key) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "key must match ^[A-Z0-9_]{1,64}$",
            ));
        }

        let _guard = self.lock.lock().expect("secrets lock");
        let path = self.key_path(key);
        let existing = read_secret_file(&path)
            .map_err(|_| KernelError::new(ErrorKind::InvalidRequest, format!("Secret not found: {key}")))?;

        let now = now_ts();
        let file = SecretFile {
            key: key.to_string(),
            value: String::new(),
            created_at: existing.created_at,
            updated_at: now.clone(),
            deleted_at: Some(now),
        };
        rumi_core::paths::atomic_write_json(&path, &file, 0o600)?;

        self.append_journal("deleted", key, actor);
        self.audit.log_system_event(
            "secret_deleted",
            true,
            details(&[("key", json!(key)), ("actor", json!(actor))]),
            None,
        );
        Ok(())
    }

    /// Metadata for every known key, sorted by key. Values never appear.
    pub fn list_keys(&self) -> Vec<SecretMeta> {
        let _guard = self.lock.lock().expect("secrets lock");
        let mut out = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(&self.secrets_dir) else {
            return out;
        };
        let mut paths: Vec<PathBuf> = read_dir
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(file) = read_secret_file(&path) else {
                continue;
            };
            let deleted = file.deleted_at.is_some();
            out.push(SecretMeta {
                key: file.key,
                exists: !deleted,
                deleted,
                created_at: Some(file.created_at),
                updated_at: Some(file.updated_at),
                deleted_at: file.deleted_at,
            });
        }
        out
    }

    /// Whether a live (non-tombstoned) secret exists for `key`.
    pub fn has_secret(&self, key: &str) -> bool {
        if !valid_key(key) {
            return false;
        }
        let _guard = self.lock.lock().expect("secrets lock");
        match read_secret_file(&self.key_path(key)) {
            Ok(file) => file.deleted_at.is_none(),
            Err(_) => false,
        }
    }

    /// Internal read path for the grant-backed `secrets.get` capability.
    ///
    /// Never routed from the HTTP surface. The caller id lands in the audit
    /// journal; the value does not.
    pub fn internal_read_value(&self, key: &str, caller_id: &str) -> Option<String> {
        self.audit.log_system_event(
            "secret_internal_read",
            true,
            details(&[("key", json!(key)), ("caller", json!(caller_id))]),
            None,
        );
        self.read_value(key)
    }

    fn read_value(&self, key: &str) -> Option<String> {
        if !valid_key(key) {
            return None;
        }
        let _guard = self.lock.lock().expect("secrets lock");
        let path = self.key_path(key);
        let file = read_secret_file(&path).ok()?;
        if file.deleted_at.is_some() || file.value.is_empty() {
            return None;
        }

        let allow_plaintext = self.plaintext_allowed();
        let plaintext = match self.crypto.decrypt(&file.value, allow_plaintext) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(key, error = %e, "failed to decrypt secret");
                if !CryptoBackend::is_encrypted(&file.value) {
                    // Plaintext on disk while fallback is disabled.
                    self.audit.log_security_event(
                        "plaintext_secret_rejected",
                        rumi_audit::AuditSeverity::Critical,
                        "Plaintext secret on disk with fallback disabled",
                        None,
                        details(&[("key", json!(key))]),
                    );
                }
                return None;
            }
        };

        if !CryptoBackend::is_encrypted(&file.value) {
            self.audit.log_security_event(
                "plaintext_fallback",
                rumi_audit::AuditSeverity::Critical,
                "Plaintext fallback used for secret read; migrating to encrypted storage",
                None,
                details(&[("key", json!(key))]),
            );
            self.migrate_to_encrypted(key, file, &plaintext);
        }

        Some(plaintext)
    }

    fn migrate_to_encrypted(&self, key: &str, file: SecretFile, plaintext: &str) {
        let sealed = match self.crypto.encrypt(plaintext) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to migrate secret to encrypted storage");
                return;
            }
        };
        let migrated = SecretFile {
            value: sealed,
            ..file
        };
        if let Err(e) = rumi_core::paths::atomic_write_json(&self.key_path(key), &migrated, 0o600) {
            tracing::warn!(key, error = %e, "failed to rewrite migrated secret");
            return;
        }
        tracing::info!(key, "migrated secret from plaintext to encrypted storage");

        if self.policy == PlaintextPolicy::Auto && !self.has_migration_marker() && self.all_encrypted() {
            self.write_migration_marker();
        }
    }

    fn append_journal(&self, action: &str, key: &str, actor: &str) {
        let entry = json!({
            "ts": now_ts(),
            "action": action,
            "key": key,
            "actor": actor,
        });
        let path = self.secrets_dir.join(JOURNAL_FILE);
        let line = format!("{entry}\n");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append secrets journal");
        }
    }
}

fn read_secret_file(path: &Path) -> Result<SecretFile, KernelError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(
        dir: &Path,
        policy: PlaintextPolicy,
        mode: SecurityMode,
    ) -> SecretsStore {
        let audit = Arc::new(AuditLogger::new(dir.join("audit")));
        SecretsStore::new(
            dir.join("secrets"),
            &dir.join(".secrets_key"),
            None,
            policy,
            mode,
            audit,
        )
        .unwrap()
    }

    fn write_plaintext_secret(dir: &Path, key: &str, value: &str) {
        let file = json!({
            "key": key,
            "value": value,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "deleted_at": null,
        });
        std::fs::create_dir_all(dir.join("secrets")).unwrap();
        std::fs::write(
            dir.join("secrets").join(format!("{key}.json")),
            serde_json::to_string_pretty(&file).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn set_then_read_roundtrips_internally() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);

        let result = store.set_secret("API_TOKEN", "tok-123", "test").unwrap();
        assert!(result.created);
        assert!(store.has_secret("API_TOKEN"));
        assert_eq!(
            store.internal_read_value("API_TOKEN", "secrets.get").as_deref(),
            Some("tok-123")
        );

        // On-disk form is encrypted.
        let raw = std::fs::read_to_string(dir.path().join("secrets/API_TOKEN.json")).unwrap();
        assert!(raw.contains(ENCRYPTED_PREFIX));
        assert!(!raw.contains("tok-123"));
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);
        assert!(store.set_secret("lowercase", "v", "t").is_err());
        assert!(store.set_secret("", "v", "t").is_err());
        assert!(store.set_secret(&"X".repeat(65), "v", "t").is_err());
        assert!(store.set_secret("WITH-DASH", "v", "t").is_err());
    }

    #[test]
    fn delete_is_a_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);
        store.set_secret("DB_PASS", "hunter2", "test").unwrap();
        store.delete_secret("DB_PASS", "test").unwrap();

        assert!(!store.has_secret("DB_PASS"));
        assert_eq!(store.internal_read_value("DB_PASS", "t"), None);

        let metas = store.list_keys();
        let meta = metas.iter().find(|m| m.key == "DB_PASS").unwrap();
        assert!(meta.deleted);
        assert!(meta.deleted_at.is_some());

        // Re-setting a tombstoned key counts as created.
        let result = store.set_secret("DB_PASS", "new", "test").unwrap();
        assert!(result.created);
        assert!(store.has_secret("DB_PASS"));
    }

    #[test]
    fn list_keys_never_contains_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);
        store.set_secret("TOKEN_A", "super-secret-value", "test").unwrap();

        let listed = serde_json::to_string(&store.list_keys()).unwrap();
        assert!(!listed.contains("super-secret-value"));
        assert!(!listed.contains(ENCRYPTED_PREFIX));
    }

    #[test]
    fn legacy_plaintext_migrates_on_read_in_permissive_auto() {
        let dir = tempfile::tempdir().unwrap();
        write_plaintext_secret(dir.path(), "LEGACY_A", "old-a");
        write_plaintext_secret(dir.path(), "LEGACY_B", "old-b");
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Permissive);

        assert_eq!(store.internal_read_value("LEGACY_A", "t").as_deref(), Some("old-a"));
        assert_eq!(store.internal_read_value("LEGACY_B", "t").as_deref(), Some("old-b"));

        // Both files now encrypted, marker written.
        for key in ["LEGACY_A", "LEGACY_B"] {
            let raw = std::fs::read_to_string(dir.path().join(format!("secrets/{key}.json"))).unwrap();
            assert!(raw.contains(ENCRYPTED_PREFIX), "{key} not migrated");
        }
        assert!(dir.path().join("secrets/.migration_complete").exists());

        // After lockdown, a fresh plaintext write reads as None.
        write_plaintext_secret(dir.path(), "LATE_PLAIN", "nope");
        assert_eq!(store.internal_read_value("LATE_PLAIN", "t"), None);
    }

    #[test]
    fn strict_mode_blocks_plaintext_even_in_auto() {
        let dir = tempfile::tempdir().unwrap();
        write_plaintext_secret(dir.path(), "LEGACY", "old");
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);
        assert_eq!(store.internal_read_value("LEGACY", "t"), None);
    }

    #[test]
    fn always_policy_reads_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        write_plaintext_secret(dir.path(), "LEGACY", "old");
        let store = store_with(dir.path(), PlaintextPolicy::Always, SecurityMode::Strict);
        assert_eq!(store.internal_read_value("LEGACY", "t").as_deref(), Some("old"));
    }

    #[test]
    fn marker_written_at_startup_when_store_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Permissive);
            store.set_secret("ONLY_ENC", "v", "t").unwrap();
        }
        // Fresh instance scans and finds everything encrypted.
        let _store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Permissive);
        assert!(dir.path().join("secrets/.migration_complete").exists());
    }

    #[test]
    fn journal_records_actions_without_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), PlaintextPolicy::Auto, SecurityMode::Strict);
        store.set_secret("K1", "value-one", "alice").unwrap();
        store.delete_secret("K1", "bob").unwrap();

        let journal = std::fs::read_to_string(dir.path().join("secrets/journal.jsonl")).unwrap();
        let lines: Vec<Value> = journal.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["action"], "set");
        assert_eq!(lines[1]["action"], "deleted");
        assert!(!journal.contains("value-one"));
    }
}
