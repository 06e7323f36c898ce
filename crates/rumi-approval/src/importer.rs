// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pack import into staging.
//!
//! Sources are a directory, a `.zip`, or a `.rumipack` (zip container).
//! Archives must carry exactly one top-level directory; its contents land
//! in `pack_staging/<staging_id>/payload/`. Every entry is containment-
//! checked before extraction and counted against file/size caps.

use rumi_audit::AuditLogger;
use rumi_core::{now_ts, ErrorKind, KernelError};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Caps applied to every import.
#[derive(Debug, Clone, Copy)]
pub struct ImportLimits {
    pub max_files: usize,
    pub max_uncompressed_bytes: u64,
    pub max_single_file_bytes: u64,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            max_files: 2000,
            max_uncompressed_bytes: 500 * 1024 * 1024,
            max_single_file_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, Serialize)]
pub struct PackImportResult {
    pub staging_id: String,
    pub pack_ids: Vec<String>,
    pub meta: Value,
}

/// Imports pack payloads into a staging area.
pub struct PackImporter {
    staging_root: PathBuf,
    limits: ImportLimits,
    audit: Arc<AuditLogger>,
}

impl PackImporter {
    /// Create an importer staging under `staging_root`.
    pub fn new(
        staging_root: impl Into<PathBuf>,
        limits: ImportLimits,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, KernelError> {
        let staging_root = staging_root.into();
        std::fs::create_dir_all(&staging_root)?;
        Ok(Self {
            staging_root,
            limits,
            audit,
        })
    }

    /// Stage a pack source. Each call produces a fresh `staging_id`.
    pub fn import_pack(
        &self,
        source_path: &Path,
        notes: &str,
        actor: &str,
    ) -> Result<PackImportResult, KernelError> {
        self.audit_event(
            "pack_import_started",
            true,
            &[("source_path", json!(source_path.to_string_lossy())), ("actor", json!(actor))],
        );

        let result = self.import_inner(source_path, notes);
        match &result {
            Ok(ok) => self.audit_event(
                "pack_import_completed",
                true,
                &[("staging_id", json!(ok.staging_id)), ("pack_ids", json!(ok.pack_ids))],
            ),
            Err(e) => self.audit_event(
                "pack_import_failed",
                false,
                &[
                    ("source_path", json!(source_path.to_string_lossy())),
                    ("error", json!(e.to_string())),
                ],
            ),
        }
        result
    }

    fn import_inner(&self, source: &Path, notes: &str) -> Result<PackImportResult, KernelError> {
        if !source.exists() {
            return Err(KernelError::new(ErrorKind::InvalidRequest, "source_not_found"));
        }

        let staging_id = uuid::Uuid::new_v4().simple().to_string();
        let staging_dir = self.staging_root.join(&staging_id);
        let payload_dir = staging_dir.join("payload");
        std::fs::create_dir_all(&payload_dir)?;

        let source_type = detect_source_type(source)?;
        let staged = match source_type {
            "directory" => self.copy_directory(source, &payload_dir),
            _ => self.extract_archive(source, &payload_dir),
        };
        if let Err(e) = staged {
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Err(e);
        }

        let pack_ids = detect_pack_ids(&payload_dir);
        let meta = json!({
            "staging_id": staging_id,
            "source_path": source.to_string_lossy(),
            "source_type": source_type,
            "notes": notes,
            "imported_at": now_ts(),
            "pack_ids": pack_ids,
        });
        rumi_core::paths::atomic_write_json(&staging_dir.join("meta.json"), &meta, 0o600)?;

        Ok(PackImportResult {
            staging_id,
            pack_ids,
            meta,
        })
    }

    fn copy_directory(&self, source: &Path, payload_dir: &Path) -> Result<(), KernelError> {
        let mut file_count = 0usize;
        let mut total_bytes = 0u64;

        for entry in WalkDir::new(source).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            let rel = path
                .strip_prefix(source)
                .map_err(|e| KernelError::internal(format!("strip prefix: {e}")))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = payload_dir.join(rel);
            if !rumi_core::paths::is_path_within(&target, payload_dir) {
                return Err(KernelError::new(
                    ErrorKind::PathTraversal,
                    format!("entry escapes payload: {}", rel.display()),
                ));
            }
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if !entry.file_type().is_file() {
                // Symlinks and specials never enter staging.
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            self.check_caps(&mut file_count, &mut total_bytes, size)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(path, &target)?;
        }
        Ok(())
    }

    fn extract_archive(&self, source: &Path, payload_dir: &Path) -> Result<(), KernelError> {
        let file = std::fs::File::open(source)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| KernelError::new(ErrorKind::InvalidRequest, format!("invalid archive: {e}")))?;

        // Pass 1: validate entry paths, find the single top directory.
        let mut top_dirs: BTreeSet<String> = BTreeSet::new();
        let mut safe_paths: Vec<Option<PathBuf>> = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| KernelError::new(ErrorKind::InvalidRequest, format!("bad archive entry: {e}")))?;
            let Some(path) = entry.enclosed_name().map(Path::to_path_buf) else {
                return Err(KernelError::new(
                    ErrorKind::ZipSlipDetected,
                    format!("archive entry escapes extraction root: {}", entry.name()),
                ));
            };
            if path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
            {
                return Err(KernelError::new(
                    ErrorKind::ZipSlipDetected,
                    format!("archive entry escapes extraction root: {}", entry.name()),
                ));
            }
            if let Some(Component::Normal(first)) = path.components().next() {
                top_dirs.insert(first.to_string_lossy().into_owned());
            }
            safe_paths.push(Some(path));
        }

        if top_dirs.len() != 1 {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("archive must contain exactly one top directory (found {})", top_dirs.len()),
            ));
        }
        let top = top_dirs.into_iter().next().expect("one top dir");
        let top_prefix = PathBuf::from(&top);

        // Pass 2: extract the top directory's contents into payload/.
        let mut file_count = 0usize;
        let mut total_bytes = 0u64;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| KernelError::new(ErrorKind::InvalidRequest, format!("bad archive entry: {e}")))?;
            let path = safe_paths[i].take().expect("validated path");
            let Ok(rel) = path.strip_prefix(&top_prefix) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = payload_dir.join(rel);
            if !rumi_core::paths::is_path_within(&target, payload_dir) {
                return Err(KernelError::new(
                    ErrorKind::ZipSlipDetected,
                    format!("archive entry escapes extraction root: {}", entry.name()),
                ));
            }

            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            self.check_caps(&mut file_count, &mut total_bytes, entry.size())?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            // Bounded copy so a lying size header cannot blow the cap.
            let mut remaining = self.limits.max_single_file_bytes + 1;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                if n as u64 > remaining {
                    return Err(KernelError::new(
                        ErrorKind::FileTooLarge,
                        format!("archive entry exceeds single-file cap: {}", entry.name()),
                    ));
                }
                remaining -= n as u64;
                std::io::Write::write_all(&mut out, &buf[..n])?;
            }
        }
        Ok(())
    }

    fn check_caps(
        &self,
        file_count: &mut usize,
        total_bytes: &mut u64,
        size: u64,
    ) -> Result<(), KernelError> {
        *file_count += 1;
        if *file_count > self.limits.max_files {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("too many files (max {})", self.limits.max_files),
            ));
        }
        if size > self.limits.max_single_file_bytes {
            return Err(KernelError::new(
                ErrorKind::FileTooLarge,
                format!("file exceeds single-file cap ({} bytes)", self.limits.max_single_file_bytes),
            ));
        }
        *total_bytes += size;
        if *total_bytes > self.limits.max_uncompressed_bytes {
            return Err(KernelError::new(
                ErrorKind::PayloadTooLarge,
                format!("import exceeds total size cap ({} bytes)", self.limits.max_uncompressed_bytes),
            ));
        }
        Ok(())
    }

    // -- Apply / uninstall ----------------------------------------------

    /// Copy a staged payload into the ecosystem root. `overwrite` controls
    /// whether an existing pack directory may be replaced.
    pub fn apply(
        &self,
        staging_id: &str,
        packs_root: &Path,
        overwrite: bool,
    ) -> Result<Vec<String>, KernelError> {
        if staging_id.is_empty() || !staging_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KernelError::new(ErrorKind::InvalidRequest, "invalid staging_id"));
        }
        let payload_dir = self.staging_root.join(staging_id).join("payload");
        if !payload_dir.is_dir() {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("staging not found: {staging_id}"),
            ));
        }

        let pack_ids = detect_pack_ids(&payload_dir);
        if pack_ids.is_empty() {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "staged payload contains no packs",
            ));
        }

        std::fs::create_dir_all(packs_root)?;
        for pack_id in &pack_ids {
            let source = pack_source_dir(&payload_dir, pack_id);
            let target = packs_root.join(pack_id);
            if target.exists() {
                if !overwrite {
                    return Err(KernelError::new(
                        ErrorKind::Conflict,
                        format!("pack already installed: {pack_id}"),
                    ));
                }
                std::fs::remove_dir_all(&target)?;
            }
            copy_tree(&source, &target)?;
        }

        self.audit_event(
            "pack_apply",
            true,
            &[("staging_id", json!(staging_id)), ("pack_ids", json!(pack_ids))],
        );
        Ok(pack_ids)
    }

    /// Remove an installed pack directory.
    pub fn uninstall(&self, pack_id: &str, packs_root: &Path) -> Result<(), KernelError> {
        let target = packs_root.join(rumi_core::sanitize_principal_id(pack_id));
        if !rumi_core::paths::is_path_within(&target, packs_root) {
            return Err(KernelError::new(ErrorKind::PathTraversal, "pack_id escapes packs root"));
        }
        if !target.is_dir() {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                format!("pack not installed: {pack_id}"),
            ));
        }
        std::fs::remove_dir_all(&target)?;
        self.audit_event("pack_uninstall", true, &[("pack_id", json!(pack_id))]);
        Ok(())
    }

    fn audit_event(&self, event: &str, success: bool, pairs: &[(&str, Value)]) {
        let details: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.audit.log_system_event(event, success, details, None);
    }
}

fn detect_source_type(source: &Path) -> Result<&'static str, KernelError> {
    if source.is_dir() {
        return Ok("directory");
    }
    match source.extension().and_then(|e| e.to_str()) {
        Some("zip") => Ok("zip"),
        Some("rumipack") => Ok("rumipack"),
        other => Err(KernelError::new(
            ErrorKind::InvalidRequest,
            format!("unsupported source type: {other:?}"),
        )),
    }
}

/// A pack is a directory holding a `pack.json`, either the payload root
/// itself (single-pack payload) or each direct child (multi-pack payload).
fn detect_pack_ids(payload_dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if payload_dir.join("pack.json").is_file() {
        if let Some(id) = pack_id_from_manifest(&payload_dir.join("pack.json")) {
            out.push(id);
            return out;
        }
    }
    let Ok(read_dir) = std::fs::read_dir(payload_dir) else {
        return out;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("pack.json").is_file() {
            let id = pack_id_from_manifest(&path.join("pack.json"))
                .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());
            out.push(id);
        }
    }
    out.sort();
    out
}

fn pack_id_from_manifest(manifest: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(manifest).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    value
        .get("pack_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Where a detected pack's files live inside the payload.
fn pack_source_dir(payload_dir: &Path, pack_id: &str) -> PathBuf {
    let direct = payload_dir.join(pack_id);
    if direct.is_dir() {
        direct
    } else {
        payload_dir.to_path_buf()
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), KernelError> {
    for entry in WalkDir::new(source).into_iter().filter_map(Result::ok) {
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| KernelError::internal(format!("strip prefix: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
