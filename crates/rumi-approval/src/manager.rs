// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval state and content-hash binding.

use rumi_audit::AuditLogger;
use rumi_core::{now_ts, ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

/// Pack lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackStatus {
    Pending,
    Approved,
    /// Content hash drifted after approval.
    Modified,
    Blocked,
    Rejected,
}

impl PackStatus {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Modified => "modified",
            Self::Blocked => "blocked",
            Self::Rejected => "rejected",
        }
    }
}

/// Approval record for one pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackRecord {
    pub pack_id: String,
    pub status: PackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalState {
    #[serde(default)]
    packs: BTreeMap<String, PackRecord>,
}

/// Approval manager over an ecosystem root of `<pack_id>/` directories.
pub struct ApprovalManager {
    packs_root: PathBuf,
    state_path: PathBuf,
    audit: Arc<AuditLogger>,
    state: Mutex<ApprovalState>,
}

impl ApprovalManager {
    /// Open the manager; state persists at `state_path`.
    pub fn new(
        packs_root: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, KernelError> {
        let packs_root = packs_root.into();
        let state_path = state_path.into();
        std::fs::create_dir_all(&packs_root)?;

        let state = match std::fs::read_to_string(&state_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => ApprovalState::default(),
        };
        Ok(Self {
            packs_root,
            state_path,
            audit,
            state: Mutex::new(state),
        })
    }

    fn pack_dir(&self, pack_id: &str) -> PathBuf {
        self.packs_root
            .join(rumi_core::sanitize_principal_id(pack_id))
    }

    fn save_locked(&self, state: &ApprovalState) -> Result<(), KernelError> {
        rumi_core::paths::atomic_write_json(&self.state_path, state, 0o600)
    }

    // -- Scanning --------------------------------------------------------

    /// Discover pack directories; unknown packs enter as `pending`.
    /// Returns every record after the scan.
    pub fn scan_packs(&self) -> Result<Vec<PackRecord>, KernelError> {
        let mut state = self.state.lock().expect("approval lock");
        let mut discovered = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(&self.packs_root) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                discovered.push(name);
            }
        }
        discovered.sort();

        let now = now_ts();
        for pack_id in &discovered {
            if !state.packs.contains_key(pack_id) {
                state.packs.insert(
                    pack_id.clone(),
                    PackRecord {
                        pack_id: pack_id.clone(),
                        status: PackStatus::Pending,
                        content_hash: None,
                        approved_at: None,
                        updated_at: now.clone(),
                        reason: None,
                    },
                );
            }
        }
        self.save_locked(&state)?;
        Ok(state.packs.values().cloned().collect())
    }

    /// Every known record.
    pub fn list_packs(&self) -> Vec<PackRecord> {
        self.state
            .lock()
            .expect("approval lock")
            .packs
            .values()
            .cloned()
            .collect()
    }

    /// One pack's record.
    pub fn get_status(&self, pack_id: &str) -> Option<PackRecord> {
        self.state
            .lock()
            .expect("approval lock")
            .packs
            .get(pack_id)
            .cloned()
    }

    // -- Transitions -----------------------------------------------------

    /// Approve a pack, recording its current content digest.
    pub fn approve(&self, pack_id: &str) -> Result<PackRecord, KernelError> {
        let dir = self.pack_dir(pack_id);
        if !dir.is_dir() {
            self.audit
                .log_approval_event(pack_id, "approve", false, None, None, Some("pack directory missing"));
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("Pack not found: {pack_id}"),
            ));
        }
        let hash = compute_tree_sha256(&dir)?;

        let mut state = self.state.lock().expect("approval lock");
        let now = now_ts();
        let previous = state.packs.get(pack_id).map(|r| r.status);
        let record = PackRecord {
            pack_id: pack_id.to_string(),
            status: PackStatus::Approved,
            content_hash: Some(hash),
            approved_at: Some(now.clone()),
            updated_at: now,
            reason: None,
        };
        state.packs.insert(pack_id.to_string(), record.clone());
        self.save_locked(&state)?;
        drop(state);

        self.audit.log_approval_event(
            pack_id,
            "approve",
            true,
            previous.map(|s| s.as_str()),
            Some(PackStatus::Approved.as_str()),
            None,
        );
        Ok(record)
    }

    /// Reject a pack with a reason.
    pub fn reject(&self, pack_id: &str, reason: &str) -> Result<PackRecord, KernelError> {
        self.transition(pack_id, PackStatus::Rejected, Some(reason), "reject")
    }

    /// Block a pack.
    pub fn block(&self, pack_id: &str, reason: &str) -> Result<PackRecord, KernelError> {
        self.transition(pack_id, PackStatus::Blocked, Some(reason), "block")
    }

    /// Drop a pack back to `pending`, clearing the recorded hash.
    pub fn remove_approval(&self, pack_id: &str) -> Result<PackRecord, KernelError> {
        self.transition(pack_id, PackStatus::Pending, None, "remove")
    }

    /// Forget a pack entirely (used by uninstall).
    pub fn forget(&self, pack_id: &str) -> Result<(), KernelError> {
        let mut state = self.state.lock().expect("approval lock");
        state.packs.remove(pack_id);
        self.save_locked(&state)?;
        drop(state);
        self.audit
            .log_approval_event(pack_id, "forget", true, None, None, None);
        Ok(())
    }

    fn transition(
        &self,
        pack_id: &str,
        status: PackStatus,
        reason: Option<&str>,
        action: &str,
    ) -> Result<PackRecord, KernelError> {
        let mut state = self.state.lock().expect("approval lock");
        let now = now_ts();
        let previous = state.packs.get(pack_id).map(|r| r.status);
        let record = PackRecord {
            pack_id: pack_id.to_string(),
            status,
            content_hash: None,
            approved_at: None,
            updated_at: now,
            reason: reason.map(str::to_string),
        };
        state.packs.insert(pack_id.to_string(), record.clone());
        self.save_locked(&state)?;
        drop(state);

        self.audit.log_approval_event(
            pack_id,
            action,
            true,
            previous.map(|s| s.as_str()),
            Some(status.as_str()),
            reason,
        );
        Ok(record)
    }

    // -- Verification ----------------------------------------------------

    /// The gate the executors call: `(true, "...")` only when the pack is
    /// approved and its tree still matches the recorded digest. A drifted
    /// tree demotes the pack to `modified` as a side effect.
    pub fn is_pack_approved_and_verified(&self, pack_id: &str) -> (bool, String) {
        let record = {
            let state = self.state.lock().expect("approval lock");
            state.packs.get(pack_id).cloned()
        };
        let Some(record) = record else {
            return (false, format!("Unknown pack: {pack_id}"));
        };
        if record.status != PackStatus::Approved {
            return (
                false,
                format!("Pack status is '{}'", record.status.as_str()),
            );
        }
        let Some(expected) = &record.content_hash else {
            return (false, "Approved pack has no recorded content hash".into());
        };

        let dir = self.pack_dir(pack_id);
        let actual = match compute_tree_sha256(&dir) {
            Ok(hash) => hash,
            Err(e) => return (false, format!("Failed to hash pack tree: {e}")),
        };
        if &actual != expected {
            // approved → modified, automatically.
            let mut state = self.state.lock().expect("approval lock");
            if let Some(entry) = state.packs.get_mut(pack_id) {
                entry.status = PackStatus::Modified;
                entry.updated_at = now_ts();
            }
            let _ = self.save_locked(&state);
            drop(state);

            self.audit.log_security_event(
                "pack_content_modified",
                rumi_audit::AuditSeverity::Critical,
                "Pack content hash no longer matches the approved digest",
                Some(pack_id),
                [
                    ("expected".to_string(), json!(expected)),
                    ("actual".to_string(), json!(actual)),
                ]
                .into_iter()
                .collect(),
            );
            return (false, "Pack content changed since approval".into());
        }

        (true, "Approved and verified".into())
    }
}

/// Digest of a directory tree: file relative paths and contents, walked in
/// sorted order so the digest is stable across platforms.
pub fn compute_tree_sha256(root: &Path) -> Result<String, KernelError> {
    let mut hasher = Sha256::new();
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    for file in files {
        let rel = file
            .strip_prefix(root)
            .map_err(|e| KernelError::internal(format!("strip prefix: {e}")))?;
        hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        let file_hash = rumi_core::paths::compute_file_sha256(&file)?;
        hasher.update(file_hash.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ApprovalManager {
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        ApprovalManager::new(
            dir.path().join("ecosystem"),
            dir.path().join("approvals.json"),
            audit,
        )
        .unwrap()
    }

    fn make_pack(dir: &TempDir, pack_id: &str) {
        let pack = dir.path().join("ecosystem").join(pack_id);
        std::fs::create_dir_all(pack.join("handlers")).unwrap();
        std::fs::write(pack.join("pack.json"), format!("{{\"pack_id\": \"{pack_id}\"}}")).unwrap();
        std::fs::write(pack.join("handlers/main.py"), "def execute(c, a):\n    return {}\n").unwrap();
    }

    #[test]
    fn scan_discovers_packs_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        make_pack(&dir, "acme");
        make_pack(&dir, "globex");

        let records = mgr.scan_packs().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == PackStatus::Pending));
    }

    #[test]
    fn approve_records_hash_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        make_pack(&dir, "acme");
        mgr.scan_packs().unwrap();

        let record = mgr.approve("acme").unwrap();
        assert_eq!(record.status, PackStatus::Approved);
        assert!(record.content_hash.is_some());

        let (ok, reason) = mgr.is_pack_approved_and_verified("acme");
        assert!(ok, "{reason}");
    }

    #[test]
    fn content_drift_demotes_to_modified() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        make_pack(&dir, "acme");
        mgr.scan_packs().unwrap();
        mgr.approve("acme").unwrap();

        std::fs::write(
            dir.path().join("ecosystem/acme/handlers/main.py"),
            "def execute(c, a):\n    return {'evil': True}\n",
        )
        .unwrap();

        let (ok, reason) = mgr.is_pack_approved_and_verified("acme");
        assert!(!ok);
        assert!(reason.contains("changed since approval"));
        assert_eq!(mgr.get_status("acme").unwrap().status, PackStatus::Modified);
    }

    #[test]
    fn non_approved_statuses_fail_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        make_pack(&dir, "acme");
        mgr.scan_packs().unwrap();

        let (ok, reason) = mgr.is_pack_approved_and_verified("acme");
        assert!(!ok);
        assert!(reason.contains("pending"));

        mgr.reject("acme", "not reviewed").unwrap();
        let (ok, reason) = mgr.is_pack_approved_and_verified("acme");
        assert!(!ok);
        assert!(reason.contains("rejected"));

        let (ok, _) = mgr.is_pack_approved_and_verified("never-seen");
        assert!(!ok);
    }

    #[test]
    fn remove_approval_returns_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        make_pack(&dir, "acme");
        mgr.scan_packs().unwrap();
        mgr.approve("acme").unwrap();
        mgr.remove_approval("acme").unwrap();

        let record = mgr.get_status("acme").unwrap();
        assert_eq!(record.status, PackStatus::Pending);
        assert!(record.content_hash.is_none());
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        make_pack(&dir, "acme");
        {
            let mgr = manager(&dir);
            mgr.scan_packs().unwrap();
            mgr.approve("acme").unwrap();
        }
        let mgr = manager(&dir);
        let (ok, reason) = mgr.is_pack_approved_and_verified("acme");
        assert!(ok, "{reason}");
    }

    #[test]
    fn tree_hash_is_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        make_pack(&dir, "acme");
        let root = dir.path().join("ecosystem/acme");

        let a = compute_tree_sha256(&root).unwrap();
        let b = compute_tree_sha256(&root).unwrap();
        assert_eq!(a, b);

        std::fs::write(root.join("extra.txt"), "x").unwrap();
        let c = compute_tree_sha256(&root).unwrap();
        assert_ne!(a, c);
    }
}
