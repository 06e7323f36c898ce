// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned unit metadata under a store root.
//!
//! A unit lives at `<store_root>/<unit_id>/<version>/unit.json` where
//! `unit_id` may contain `/` separators (`namespace/name`). Every path
//! segment is validated before it touches the filesystem.

use rumi_core::{ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Execution modes a unit may declare.
pub const KNOWN_EXEC_MODES: [&str; 3] = ["host_capability", "pack_container", "sandbox"];

/// Kinds a unit may declare.
pub const ALLOWED_KINDS: [&str; 3] = ["data", "python", "binary"];

/// Unit metadata (`unit.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitMeta {
    pub unit_id: String,
    pub version: String,
    /// `data`, `python`, or `binary`.
    pub kind: String,
    /// Relative entrypoint inside the unit directory; required for
    /// executable kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub exec_modes_allowed: Vec<String>,
    /// Permission gating execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<String>,
    /// Directory holding the unit's files. Filled in at load time.
    #[serde(skip)]
    pub unit_dir: PathBuf,
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 128
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && segment != "."
        && segment != ".."
}

fn unit_rel_path(unit_id: &str, version: &str) -> Result<PathBuf, KernelError> {
    let mut path = PathBuf::new();
    let segments: Vec<&str> = unit_id.split('/').collect();
    if segments.is_empty() || segments.len() > 4 {
        return Err(KernelError::new(
            ErrorKind::InvalidRequest,
            "unit_id must have 1-4 path segments",
        ));
    }
    for segment in segments {
        if !valid_segment(segment) {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("invalid unit_id segment: {segment:?}"),
            ));
        }
        path.push(segment);
    }
    if !valid_segment(version) {
        return Err(KernelError::new(
            ErrorKind::InvalidRequest,
            format!("invalid version: {version:?}"),
        ));
    }
    path.push(version);
    Ok(path)
}

/// Reads and writes `unit.json` files under store roots.
#[derive(Debug, Default)]
pub struct UnitRegistry;

impl UnitRegistry {
    /// Load one unit's metadata, or `None` when it is not published.
    pub fn get_unit(
        &self,
        store_root: &Path,
        unit_id: &str,
        version: &str,
    ) -> Result<Option<UnitMeta>, KernelError> {
        let unit_dir = store_root.join(unit_rel_path(unit_id, version)?);
        if !rumi_core::paths::is_path_within(&unit_dir, store_root) {
            return Err(KernelError::new(
                ErrorKind::PathTraversal,
                "unit path escapes store root",
            ));
        }
        let manifest = unit_dir.join("unit.json");
        if !manifest.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&manifest)?;
        let mut meta: UnitMeta = serde_json::from_str(&raw)?;
        meta.unit_dir = unit_dir;
        Ok(Some(meta))
    }

    /// Publish (write) unit metadata. The unit directory is created; files
    /// referenced by `entrypoint` are the publisher's responsibility.
    pub fn publish_unit(&self, store_root: &Path, meta: &UnitMeta) -> Result<PathBuf, KernelError> {
        if !ALLOWED_KINDS.contains(&meta.kind.as_str()) {
            return Err(KernelError::new(
                ErrorKind::UnknownKind,
                format!("kind must be one of {ALLOWED_KINDS:?}"),
            ));
        }
        for mode in &meta.exec_modes_allowed {
            if !KNOWN_EXEC_MODES.contains(&mode.as_str()) {
                return Err(KernelError::new(
                    ErrorKind::InvalidRequest,
                    format!("unknown exec mode: {mode}"),
                ));
            }
        }
        if matches!(meta.kind.as_str(), "python" | "binary") && meta.entrypoint.is_none() {
            return Err(KernelError::new(
                ErrorKind::MissingEntrypoint,
                "executable units require an entrypoint",
            ));
        }

        let unit_dir = store_root.join(unit_rel_path(&meta.unit_id, &meta.version)?);
        if !rumi_core::paths::is_path_within(&unit_dir, store_root) {
            return Err(KernelError::new(
                ErrorKind::PathTraversal,
                "unit path escapes store root",
            ));
        }
        std::fs::create_dir_all(&unit_dir)?;
        rumi_core::paths::atomic_write_json(&unit_dir.join("unit.json"), meta, 0o644)?;
        Ok(unit_dir)
    }

    /// Every published unit under a store root.
    pub fn list_units(&self, store_root: &Path) -> Vec<UnitMeta> {
        let mut out = Vec::new();
        let mut stack = vec![store_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(read_dir) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.file_name().and_then(|n| n.to_str()) == Some("unit.json") {
                    let Ok(raw) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    match serde_json::from_str::<UnitMeta>(&raw) {
                        Ok(mut meta) => {
                            meta.unit_dir = path.parent().unwrap_or(store_root).to_path_buf();
                            out.push(meta);
                        }
                        Err(e) => {
                            tracing::warn!(file = %path.display(), error = %e, "skipped invalid unit.json")
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| (&a.unit_id, &a.version).cmp(&(&b.unit_id, &b.version)));
        out
    }

    /// SHA-256 of a unit's entrypoint file, containment-checked.
    pub fn compute_entrypoint_sha256(
        &self,
        unit_dir: &Path,
        entrypoint: &str,
    ) -> Result<String, KernelError> {
        let ep_path = unit_dir.join(entrypoint);
        if !rumi_core::paths::is_path_within(&ep_path, unit_dir) {
            return Err(KernelError::new(
                ErrorKind::PathTraversal,
                format!("entrypoint escapes unit dir: {entrypoint}"),
            ));
        }
        rumi_core::paths::compute_file_sha256(&ep_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(unit_id: &str, version: &str, kind: &str) -> UnitMeta {
        UnitMeta {
            unit_id: unit_id.into(),
            version: version.into(),
            kind: kind.into(),
            entrypoint: if kind == "data" { None } else { Some("main.py".into()) },
            exec_modes_allowed: vec!["host_capability".into()],
            permission_id: Some("unit.run".into()),
            unit_dir: PathBuf::new(),
        }
    }

    #[test]
    fn publish_then_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let reg = UnitRegistry;
        let unit_dir = reg
            .publish_unit(dir.path(), &meta("tools/hasher", "1.0.0", "python"))
            .unwrap();
        assert!(unit_dir.ends_with("tools/hasher/1.0.0"));

        let loaded = reg
            .get_unit(dir.path(), "tools/hasher", "1.0.0")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.kind, "python");
        assert_eq!(loaded.unit_dir, unit_dir);
        assert!(reg.get_unit(dir.path(), "tools/hasher", "2.0.0").unwrap().is_none());
    }

    #[test]
    fn traversal_segments_are_rejected() {
        let dir = TempDir::new().unwrap();
        let reg = UnitRegistry;
        assert!(reg.get_unit(dir.path(), "../evil", "1.0").is_err());
        assert!(reg.get_unit(dir.path(), "ok", "..").is_err());
        assert!(reg.get_unit(dir.path(), "a/../b", "1.0").is_err());
    }

    #[test]
    fn publish_validates_kind_mode_and_entrypoint() {
        let dir = TempDir::new().unwrap();
        let reg = UnitRegistry;

        let mut bad_kind = meta("u", "1.0", "python");
        bad_kind.kind = "lua".into();
        assert_eq!(
            reg.publish_unit(dir.path(), &bad_kind).unwrap_err().kind,
            ErrorKind::UnknownKind
        );

        let mut bad_mode = meta("u", "1.0", "python");
        bad_mode.exec_modes_allowed = vec!["teleport".into()];
        assert!(reg.publish_unit(dir.path(), &bad_mode).is_err());

        let mut no_ep = meta("u", "1.0", "python");
        no_ep.entrypoint = None;
        assert_eq!(
            reg.publish_unit(dir.path(), &no_ep).unwrap_err().kind,
            ErrorKind::MissingEntrypoint
        );

        // data units need no entrypoint.
        assert!(reg.publish_unit(dir.path(), &meta("d", "1.0", "data")).is_ok());
    }

    #[test]
    fn list_units_finds_all_versions() {
        let dir = TempDir::new().unwrap();
        let reg = UnitRegistry;
        reg.publish_unit(dir.path(), &meta("tools/a", "1.0", "python")).unwrap();
        reg.publish_unit(dir.path(), &meta("tools/a", "1.1", "python")).unwrap();
        reg.publish_unit(dir.path(), &meta("b", "0.1", "data")).unwrap();

        let units = reg.list_units(dir.path());
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].unit_id, "b");
        assert_eq!(units[1].version, "1.0");
        assert_eq!(units[2].version, "1.1");
    }

    #[test]
    fn entrypoint_sha256_is_containment_checked() {
        let dir = TempDir::new().unwrap();
        let reg = UnitRegistry;
        let unit_dir = reg
            .publish_unit(dir.path(), &meta("u", "1.0", "python"))
            .unwrap();
        std::fs::write(unit_dir.join("main.py"), "print('hi')\n").unwrap();

        let sha = reg.compute_entrypoint_sha256(&unit_dir, "main.py").unwrap();
        assert_eq!(sha, rumi_core::paths::compute_bytes_sha256(b"print('hi')\n"));

        assert!(reg
            .compute_entrypoint_sha256(&unit_dir, "../../../etc/passwd")
            .is_err());
    }
}
