// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-trust
//!
//! SHA-256 allowlists binding executable identifiers to the exact bytes
//! they were reviewed as. Units are keyed by `(unit_id, version)`, handlers
//! by `handler_id` alone. Invalid entries are skipped with warnings but do
//! not fail a load; a load that does fail keeps the previous cache version
//! so stale readers keep getting the prior decision.
//!
//! With auto-reload enabled (`RUMI_TRUST_AUTO_RELOAD=1`), every lookup
//! first compares the backing file's mtime and reloads on change.

#![deny(unsafe_code)]

use rumi_audit::{AuditLogger, AuditSeverity};
use rumi_core::{ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Valid kinds for a trusted executable.
pub const VALID_TRUST_KINDS: [&str; 2] = ["python", "binary"];

fn valid_sha256(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Whether entries carry a version (units) or not (handlers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustFlavor {
    /// Keyed by `(unit_id, version)`.
    Unit,
    /// Keyed by `handler_id` alone.
    Handler,
}

/// One allowlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedEntry {
    /// Unit or handler identifier.
    #[serde(alias = "unit_id", alias = "handler_id")]
    pub id: String,
    /// Version, present for units only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Expected SHA-256 of the entrypoint bytes, lowercase hex.
    pub sha256: String,
    /// Executable kind: `python` or `binary`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Reviewer note.
    #[serde(default)]
    pub note: String,
}

fn default_kind() -> String {
    "python".to_string()
}

/// Outcome of a trust lookup.
#[derive(Debug, Clone)]
pub struct TrustCheckResult {
    pub trusted: bool,
    pub reason: String,
    pub expected_sha256: Option<String>,
    pub actual_sha256: String,
}

#[derive(Default)]
struct TrustState {
    trusted: HashMap<(String, String), TrustedEntry>,
    loaded: bool,
    load_error: Option<String>,
    load_warnings: Vec<String>,
    cache_version: u64,
    last_mtime: Option<SystemTime>,
}

/// A trust allowlist backed by one JSON file.
pub struct TrustStore {
    trust_file: PathBuf,
    flavor: TrustFlavor,
    auto_reload: bool,
    audit: Arc<AuditLogger>,
    state: Mutex<TrustState>,
}

impl TrustStore {
    /// Create a store over `trust_file`. Call [`TrustStore::load`] before
    /// the first lookup (lookups on an unloaded store deny).
    pub fn new(
        trust_file: impl Into<PathBuf>,
        flavor: TrustFlavor,
        auto_reload: bool,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            trust_file: trust_file.into(),
            flavor,
            auto_reload,
            audit,
            state: Mutex::new(TrustState::default()),
        }
    }

    fn version_key(&self, version: Option<&str>) -> String {
        match self.flavor {
            TrustFlavor::Unit => version.unwrap_or("").to_string(),
            TrustFlavor::Handler => String::new(),
        }
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.trust_file)
            .and_then(|m| m.modified())
            .ok()
    }

    // -- Load / reload ---------------------------------------------------

    /// Parse the trust file. Invalid entries are skipped with warnings.
    /// Returns `false` (and keeps the previous cache version) on a file
    /// that cannot be parsed at all.
    pub fn load(&self) -> bool {
        let mut state = self.state.lock().expect("trust lock");
        self.load_locked(&mut state)
    }

    fn load_locked(&self, state: &mut TrustState) -> bool {
        state.trusted.clear();
        state.load_warnings.clear();
        state.loaded = false;
        state.load_error = None;

        if !self.trust_file.exists() {
            state.loaded = true;
            state.cache_version += 1;
            state.last_mtime = None;
            return true;
        }

        let data: serde_json::Value = match std::fs::read_to_string(&self.trust_file)
            .map_err(KernelError::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(KernelError::from))
        {
            Ok(v) => v,
            Err(e) => {
                state.load_error = Some(format!("Failed to parse trust file: {e}"));
                return false;
            }
        };
        let Some(entries) = data.get("trusted").and_then(|v| v.as_array()) else {
            state.load_error = Some("Trust file must contain a 'trusted' list".into());
            return false;
        };

        for raw in entries {
            let mut entry: TrustedEntry = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(e) => {
                    state.load_warnings.push(format!("Skipped invalid entry: {e}"));
                    continue;
                }
            };
            if entry.id.is_empty() {
                state.load_warnings.push("Skipped entry: empty id".into());
                continue;
            }
            if self.flavor == TrustFlavor::Unit
                && entry.version.as_deref().unwrap_or("").is_empty()
            {
                state
                    .load_warnings
                    .push(format!("Skipped entry: missing version (id={})", entry.id));
                continue;
            }
            let sha = entry.sha256.to_lowercase();
            if !valid_sha256(&sha) {
                state.load_warnings.push(format!(
                    "Skipped entry: invalid sha256={:?} (id={})",
                    entry.sha256, entry.id
                ));
                continue;
            }
            entry.sha256 = sha;
            if !VALID_TRUST_KINDS.contains(&entry.kind.as_str()) {
                state.load_warnings.push(format!(
                    "Invalid kind={:?} for id={}, defaulting to 'python'",
                    entry.kind, entry.id
                ));
                entry.kind = default_kind();
            }
            let key = (entry.id.clone(), self.version_key(entry.version.as_deref()));
            state.trusted.insert(key, entry);
        }

        for warning in &state.load_warnings {
            tracing::warn!(file = %self.trust_file.display(), "{warning}");
        }

        state.loaded = true;
        state.cache_version += 1;
        state.last_mtime = self.file_mtime();
        true
    }

    /// Reload when the backing file's mtime changed. Returns whether a
    /// reload was attempted.
    pub fn reload_if_modified(&self) -> bool {
        let mut state = self.state.lock().expect("trust lock");
        if self.file_mtime() == state.last_mtime {
            return false;
        }
        if self.load_locked(&mut state) {
            self.audit.log_security_event(
                "trust_store_reloaded",
                AuditSeverity::Info,
                "Trust store reloaded due to file modification",
                None,
                [("cache_version".to_string(), json!(state.cache_version))]
                    .into_iter()
                    .collect(),
            );
        }
        true
    }

    /// Whether the last load completed.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().expect("trust lock").loaded
    }

    /// Warnings accumulated by the last load.
    pub fn load_warnings(&self) -> Vec<String> {
        self.state.lock().expect("trust lock").load_warnings.clone()
    }

    /// Monotonic version, bumped on every successful load.
    pub fn cache_version(&self) -> u64 {
        self.state.lock().expect("trust lock").cache_version
    }

    // -- Query -----------------------------------------------------------

    /// Check an identifier against the allowlist.
    ///
    /// `actual_sha256` is the hash computed from the bytes about to run;
    /// `kind`, when supplied, must match the recorded kind.
    pub fn is_trusted(
        &self,
        id: &str,
        version: Option<&str>,
        actual_sha256: &str,
        kind: Option<&str>,
    ) -> TrustCheckResult {
        if self.auto_reload {
            self.reload_if_modified();
        }

        let state = self.state.lock().expect("trust lock");
        let denied = |reason: String, expected: Option<String>| TrustCheckResult {
            trusted: false,
            reason,
            expected_sha256: expected,
            actual_sha256: actual_sha256.to_string(),
        };

        if !state.loaded {
            return denied("Trust store is not loaded".into(), None);
        }

        let key = (id.to_string(), self.version_key(version));
        let Some(entry) = state.trusted.get(&key) else {
            let label = match self.flavor {
                TrustFlavor::Unit => format!("{id} v{}", version.unwrap_or("?")),
                TrustFlavor::Handler => id.to_string(),
            };
            return denied(format!("No trust entry for {label}"), None);
        };

        if let Some(kind) = kind {
            if entry.kind != kind {
                return denied(
                    format!("Kind mismatch: trusted as '{}', requested '{kind}'", entry.kind),
                    Some(entry.sha256.clone()),
                );
            }
        }

        if entry.sha256 != actual_sha256.to_lowercase() {
            return denied(
                format!("sha256 mismatch for {id}"),
                Some(entry.sha256.clone()),
            );
        }

        TrustCheckResult {
            trusted: true,
            reason: "Trusted".into(),
            expected_sha256: Some(entry.sha256.clone()),
            actual_sha256: actual_sha256.to_string(),
        }
    }

    // -- Mutation --------------------------------------------------------

    /// Add (or replace) an allowlist entry and persist atomically.
    pub fn add_trust(&self, entry: TrustedEntry) -> Result<(), KernelError> {
        if entry.id.is_empty() {
            return Err(KernelError::new(ErrorKind::InvalidRequest, "id must be non-empty"));
        }
        if self.flavor == TrustFlavor::Unit && entry.version.as_deref().unwrap_or("").is_empty() {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "version must be non-empty",
            ));
        }
        let sha = entry.sha256.to_lowercase();
        if !valid_sha256(&sha) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "sha256 must be a 64-character hex string",
            ));
        }
        if !VALID_TRUST_KINDS.contains(&entry.kind.as_str()) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("kind must be one of {VALID_TRUST_KINDS:?}"),
            ));
        }

        let mut state = self.state.lock().expect("trust lock");
        let key = (entry.id.clone(), self.version_key(entry.version.as_deref()));
        state.trusted.insert(key, TrustedEntry { sha256: sha, ..entry });
        self.persist_locked(&mut state)
    }

    /// Remove an entry; `Ok(false)` when it did not exist.
    pub fn remove_trust(&self, id: &str, version: Option<&str>) -> Result<bool, KernelError> {
        let mut state = self.state.lock().expect("trust lock");
        let key = (id.to_string(), self.version_key(version));
        if state.trusted.remove(&key).is_none() {
            return Ok(false);
        }
        self.persist_locked(&mut state)?;
        Ok(true)
    }

    /// Entries, optionally filtered by kind, sorted by id then version.
    pub fn list_trusted(&self, kind: Option<&str>) -> Vec<TrustedEntry> {
        let state = self.state.lock().expect("trust lock");
        let mut entries: Vec<TrustedEntry> = state
            .trusted
            .values()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (&a.id, &a.version).cmp(&(&b.id, &b.version)));
        entries
    }

    fn persist_locked(&self, state: &mut TrustState) -> Result<(), KernelError> {
        let mut entries: Vec<&TrustedEntry> = state.trusted.values().collect();
        entries.sort_by(|a, b| (&a.id, &a.version).cmp(&(&b.id, &b.version)));
        let body = json!({ "trusted": entries });
        rumi_core::paths::atomic_write_json(&self.trust_file, &body, 0o600)?;
        state.cache_version += 1;
        state.last_mtime = self.file_mtime();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn unit_store(dir: &TempDir) -> TrustStore {
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        TrustStore::new(
            dir.path().join("trusted_units.json"),
            TrustFlavor::Unit,
            false,
            audit,
        )
    }

    fn entry(id: &str, version: &str, sha: &str) -> TrustedEntry {
        TrustedEntry {
            id: id.into(),
            version: Some(version.into()),
            sha256: sha.into(),
            kind: "python".into(),
            note: String::new(),
        }
    }

    #[test]
    fn missing_file_loads_empty_and_denies() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        assert!(store.load());
        assert!(store.is_loaded());
        let result = store.is_trusted("u1", Some("1.0"), SHA_A, None);
        assert!(!result.trusted);
        assert!(result.reason.contains("No trust entry"));
    }

    #[test]
    fn lookup_matches_id_version_and_sha() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        store.add_trust(entry("u1", "1.0", SHA_A)).unwrap();

        assert!(store.is_trusted("u1", Some("1.0"), SHA_A, None).trusted);
        // Wrong version.
        assert!(!store.is_trusted("u1", Some("2.0"), SHA_A, None).trusted);
        // Wrong hash carries the expectation in the result.
        let result = store.is_trusted("u1", Some("1.0"), SHA_B, None);
        assert!(!result.trusted);
        assert_eq!(result.expected_sha256.as_deref(), Some(SHA_A));
        assert!(result.reason.contains("sha256 mismatch"));
    }

    #[test]
    fn kind_filter_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        store.add_trust(entry("u1", "1.0", SHA_A)).unwrap();

        assert!(store.is_trusted("u1", Some("1.0"), SHA_A, Some("python")).trusted);
        let result = store.is_trusted("u1", Some("1.0"), SHA_A, Some("binary"));
        assert!(!result.trusted);
        assert!(result.reason.contains("Kind mismatch"));
    }

    #[test]
    fn uppercase_hash_input_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        store
            .add_trust(entry("u1", "1.0", &SHA_A.to_uppercase()))
            .unwrap();
        assert!(store.is_trusted("u1", Some("1.0"), &SHA_A.to_uppercase(), None).trusted);
    }

    #[test]
    fn invalid_entries_are_skipped_without_failing_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("trusted_units.json");
        std::fs::write(
            &file,
            serde_json::to_string(&json!({
                "trusted": [
                    {"unit_id": "good", "version": "1.0", "sha256": SHA_A, "kind": "python"},
                    {"unit_id": "", "version": "1.0", "sha256": SHA_A},
                    {"unit_id": "no-version", "sha256": SHA_A},
                    {"unit_id": "bad-sha", "version": "1.0", "sha256": "zz"},
                    {"unit_id": "bad-kind", "version": "1.0", "sha256": SHA_B, "kind": "lua"},
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        let store = TrustStore::new(file.clone(), TrustFlavor::Unit, false, audit);
        assert!(store.load());
        assert!(store.is_loaded());
        assert_eq!(store.load_warnings().len(), 4);
        assert!(store.is_trusted("good", Some("1.0"), SHA_A, None).trusted);
        // Invalid kind fell back to python.
        assert!(store.is_trusted("bad-kind", Some("1.0"), SHA_B, Some("python")).trusted);
    }

    #[test]
    fn failed_load_keeps_previous_cache_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        store.add_trust(entry("u1", "1.0", SHA_A)).unwrap();
        let version_before = store.cache_version();

        std::fs::write(dir.path().join("trusted_units.json"), "not json").unwrap();
        assert!(!store.load());
        assert_eq!(store.cache_version(), version_before);
        assert!(!store.is_loaded());
    }

    #[test]
    fn reload_if_modified_detects_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        assert!(!store.reload_if_modified(), "unchanged file should not reload");

        // An external writer replaces the file.
        std::fs::write(
            dir.path().join("trusted_units.json"),
            serde_json::to_string(&json!({
                "trusted": [{"unit_id": "u2", "version": "2.0", "sha256": SHA_B}]
            }))
            .unwrap(),
        )
        .unwrap();
        assert!(store.reload_if_modified());
        assert!(store.is_trusted("u2", Some("2.0"), SHA_B, None).trusted);
    }

    #[test]
    fn handler_flavor_ignores_version() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        let store = TrustStore::new(
            dir.path().join("trusted_handlers.json"),
            TrustFlavor::Handler,
            false,
            audit,
        );
        store.load();
        store
            .add_trust(TrustedEntry {
                id: "fs.write".into(),
                version: None,
                sha256: SHA_A.into(),
                kind: "python".into(),
                note: String::new(),
            })
            .unwrap();

        assert!(store.is_trusted("fs.write", None, SHA_A, None).trusted);
        assert!(store.is_trusted("fs.write", Some("anything"), SHA_A, None).trusted);
    }

    #[test]
    fn add_trust_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        assert!(store.add_trust(entry("", "1.0", SHA_A)).is_err());
        assert!(store.add_trust(entry("u", "", SHA_A)).is_err());
        assert!(store.add_trust(entry("u", "1.0", "short")).is_err());
        let mut bad_kind = entry("u", "1.0", SHA_A);
        bad_kind.kind = "lua".into();
        assert!(store.add_trust(bad_kind).is_err());
    }

    #[test]
    fn remove_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = unit_store(&dir);
        store.load();
        store.add_trust(entry("a", "1.0", SHA_A)).unwrap();
        let mut bin = entry("b", "1.0", SHA_B);
        bin.kind = "binary".into();
        store.add_trust(bin).unwrap();

        assert_eq!(store.list_trusted(None).len(), 2);
        assert_eq!(store.list_trusted(Some("binary")).len(), 1);

        assert!(store.remove_trust("a", Some("1.0")).unwrap());
        assert!(!store.remove_trust("a", Some("1.0")).unwrap());
        assert_eq!(store.list_trusted(None).len(), 1);
    }

    #[test]
    fn entries_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = unit_store(&dir);
            store.load();
            store.add_trust(entry("u1", "1.0", SHA_A)).unwrap();
        }
        let store = unit_store(&dir);
        store.load();
        assert!(store.is_trusted("u1", Some("1.0"), SHA_A, None).trusted);
    }
}
