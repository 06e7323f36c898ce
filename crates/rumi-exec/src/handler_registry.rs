// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability handler registry.
//!
//! Handlers live at `capabilities/handlers/<slug>/handler.json` next to
//! their entrypoint file. The registry is a plain `permission_id →
//! HandlerDefinition` map; a duplicate `permission_id` is a startup
//! failure — ambiguous dispatch is never allowed, so the registry flags
//! itself unloaded and the capability subsystem stays down.

use rumi_audit::{AuditLogger, AuditSeverity};
use rumi_core::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One registered handler.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerDefinition {
    pub handler_id: String,
    pub permission_id: String,
    /// `file:func` inside the handler directory.
    pub entrypoint: String,
    pub description: String,
    /// Core-shipped handlers bypass the trust allowlist.
    pub is_builtin: bool,
    pub handler_dir: PathBuf,
    /// Resolved entrypoint file.
    pub entrypoint_path: PathBuf,
    /// SHA-256 of the entrypoint at load time (informational; the
    /// executor re-hashes at call time).
    pub entrypoint_sha256: String,
    pub slug: String,
}

impl HandlerDefinition {
    /// The function name after the `:` in the entrypoint.
    pub fn entrypoint_func(&self) -> &str {
        self.entrypoint
            .rsplit_once(':')
            .map(|(_, func)| func)
            .unwrap_or("execute")
    }
}

#[derive(Debug, Deserialize)]
struct HandlerManifest {
    handler_id: String,
    permission_id: String,
    #[serde(default = "default_entrypoint")]
    entrypoint: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    is_builtin: bool,
}

fn default_entrypoint() -> String {
    "handler.py:execute".to_string()
}

/// Result of a registry scan.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryLoadResult {
    pub success: bool,
    pub handlers_loaded: usize,
    pub errors: Vec<Value>,
    pub duplicates: Vec<Value>,
}

/// Scans handler directories into a permission-id index.
pub struct HandlerRegistry {
    handlers_dir: PathBuf,
    audit: Arc<AuditLogger>,
    by_permission_id: BTreeMap<String, HandlerDefinition>,
    load_errors: Vec<Value>,
    duplicates: Vec<Value>,
    loaded: bool,
}

impl HandlerRegistry {
    /// Create an unloaded registry; call [`HandlerRegistry::load_all`].
    pub fn new(handlers_dir: impl Into<PathBuf>, audit: Arc<AuditLogger>) -> Self {
        Self {
            handlers_dir: handlers_dir.into(),
            audit,
            by_permission_id: BTreeMap::new(),
            load_errors: Vec::new(),
            duplicates: Vec::new(),
            loaded: false,
        }
    }

    /// Scan every `<slug>/handler.json`. A duplicate `permission_id`
    /// anywhere makes the whole load fail.
    pub fn load_all(&mut self) -> RegistryLoadResult {
        self.by_permission_id.clear();
        self.load_errors.clear();
        self.duplicates.clear();
        self.loaded = false;

        if !self.handlers_dir.exists() {
            self.loaded = true;
            return self.result(true);
        }

        let mut slug_dirs: Vec<PathBuf> = match std::fs::read_dir(&self.handlers_dir) {
            Ok(read_dir) => read_dir
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_dir()
                        && !p
                            .file_name()
                            .map(|n| n.to_string_lossy().starts_with('.'))
                            .unwrap_or(true)
                })
                .collect(),
            Err(e) => {
                self.load_errors
                    .push(json!({"error": format!("failed to read handlers dir: {e}")}));
                return self.result(false);
            }
        };
        slug_dirs.sort();

        let mut candidates: HashMap<String, Vec<HandlerDefinition>> = HashMap::new();
        let mut seen_handler_ids: HashMap<String, String> = HashMap::new();

        for slug_dir in slug_dirs {
            let slug = slug_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let manifest_path = slug_dir.join("handler.json");
            if !manifest_path.exists() {
                self.load_errors.push(json!({
                    "slug": slug, "error": "handler.json not found",
                }));
                continue;
            }
            let def = match load_handler(&slug_dir, &manifest_path, &slug) {
                Ok(def) => def,
                Err(e) => {
                    self.load_errors.push(json!({
                        "slug": slug, "error": e.to_string(),
                    }));
                    continue;
                }
            };

            if let Some(existing_slug) = seen_handler_ids.get(&def.handler_id) {
                self.load_errors.push(json!({
                    "slug": slug,
                    "error": format!("Duplicate handler_id: {}", def.handler_id),
                    "existing_slug": existing_slug,
                }));
                continue;
            }
            seen_handler_ids.insert(def.handler_id.clone(), slug.clone());
            candidates.entry(def.permission_id.clone()).or_default().push(def);
        }

        let mut has_duplicates = false;
        for (permission_id, mut handlers) in candidates {
            if handlers.len() > 1 {
                has_duplicates = true;
                self.duplicates.push(json!({
                    "permission_id": permission_id,
                    "handler_count": handlers.len(),
                    "handlers": handlers
                        .iter()
                        .map(|h| json!({"handler_id": h.handler_id, "slug": h.slug}))
                        .collect::<Vec<_>>(),
                }));
            } else {
                let def = handlers.pop().expect("one handler");
                self.by_permission_id.insert(permission_id, def);
            }
        }

        if has_duplicates {
            self.by_permission_id.clear();
            self.audit_duplicates();
            return self.result(false);
        }

        self.loaded = true;
        self.result(true)
    }

    fn result(&self, success: bool) -> RegistryLoadResult {
        RegistryLoadResult {
            success,
            handlers_loaded: self.by_permission_id.len(),
            errors: self.load_errors.clone(),
            duplicates: self.duplicates.clone(),
        }
    }

    fn audit_duplicates(&self) {
        for dup in &self.duplicates {
            let mut details = Map::new();
            details.insert("duplicate".into(), dup.clone());
            self.audit.log_security_event(
                "capability_handler_duplicate_permission",
                AuditSeverity::Error,
                "Duplicate permission_id across handlers; capability registry not loaded",
                None,
                details,
            );
        }
    }

    /// Whether the last load completed without duplicates.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Lookup by permission id.
    pub fn get_by_permission_id(&self, permission_id: &str) -> Option<&HandlerDefinition> {
        self.by_permission_id.get(permission_id)
    }

    /// All handlers, ordered by permission id.
    pub fn list_all(&self) -> Vec<&HandlerDefinition> {
        self.by_permission_id.values().collect()
    }
}

fn load_handler(
    slug_dir: &Path,
    manifest_path: &Path,
    slug: &str,
) -> Result<HandlerDefinition, KernelError> {
    let raw = std::fs::read_to_string(manifest_path)?;
    let manifest: HandlerManifest = serde_json::from_str(&raw)?;

    if !manifest.entrypoint.contains(':') {
        return Err(KernelError::invalid(format!(
            "Invalid entrypoint format (expected 'file:func'): {}",
            manifest.entrypoint
        )));
    }
    let (ep_file, _) = manifest.entrypoint.rsplit_once(':').expect("checked above");
    let entrypoint_path = slug_dir.join(ep_file);
    if !rumi_core::paths::is_path_within(&entrypoint_path, slug_dir) {
        return Err(KernelError::new(
            rumi_core::ErrorKind::PathTraversal,
            format!("entrypoint escapes handler dir: {ep_file}"),
        ));
    }
    if !entrypoint_path.exists() {
        return Err(KernelError::invalid(format!(
            "Entrypoint file not found: {ep_file}"
        )));
    }

    let sha256 = rumi_core::paths::compute_file_sha256(&entrypoint_path)?;
    Ok(HandlerDefinition {
        handler_id: manifest.handler_id,
        permission_id: manifest.permission_id,
        entrypoint: manifest.entrypoint,
        description: manifest.description,
        is_builtin: manifest.is_builtin,
        handler_dir: slug_dir.to_path_buf(),
        entrypoint_path,
        entrypoint_sha256: sha256,
        slug: slug.to_string(),
    })
}
