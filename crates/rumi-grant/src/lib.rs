// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-grant
//!
//! Per-principal permission grants, one HMAC-signed JSON file per
//! principal. The capability and network variants share this shape and
//! differ only in their directory and audit label.
//!
//! Checks re-read grant files from disk every time — there is no cached
//! decision to go stale — while tamper detection latches: once a file
//! fails HMAC verification, that principal stays denied for the process
//! lifetime, at every hierarchy level, until a mutation rewrites the file
//! with a fresh signature.

#![deny(unsafe_code)]

use rumi_audit::{AuditLogger, AuditSeverity};
use rumi_core::signing::{compute_data_hmac, verify_data_hmac};
use rumi_core::{
    intersect_config, now_ts, parse_principal_chain, sanitize_principal_id, ErrorKind, KernelError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One permission inside a grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A principal's grant file payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    #[serde(default = "grant_version")]
    pub version: String,
    pub principal_id: String,
    pub enabled: bool,
    pub granted_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionGrant>,
}

fn grant_version() -> String {
    "1.0".to_string()
}

/// Outcome of a grant check.
#[derive(Debug, Clone)]
pub struct GrantCheckResult {
    pub allowed: bool,
    /// Full reason; policy denials surface only through audit.
    pub reason: String,
    pub principal_id: String,
    pub permission_id: String,
    /// Effective config: the intersection down the hierarchy chain.
    pub config: Map<String, Value>,
}

impl GrantCheckResult {
    fn denied(principal_id: &str, permission_id: &str, reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            principal_id: principal_id.to_string(),
            permission_id: permission_id.to_string(),
            config: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// GrantManager
// ---------------------------------------------------------------------------

/// Grant store for one permission type (`"capability"` or `"network"`).
pub struct GrantManager {
    grants_dir: PathBuf,
    permission_type: &'static str,
    signing_key: Vec<u8>,
    audit: Arc<AuditLogger>,
    tampered: Mutex<HashSet<String>>,
}

impl GrantManager {
    /// Open a manager over `grants_dir` (created eagerly).
    pub fn new(
        grants_dir: impl Into<PathBuf>,
        permission_type: &'static str,
        signing_key: Vec<u8>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, KernelError> {
        let grants_dir = grants_dir.into();
        std::fs::create_dir_all(&grants_dir)?;
        Ok(Self {
            grants_dir,
            permission_type,
            signing_key,
            audit,
            tampered: Mutex::new(HashSet::new()),
        })
    }

    fn grant_file(&self, principal_id: &str) -> PathBuf {
        self.grants_dir
            .join(format!("{}.json", sanitize_principal_id(principal_id)))
    }

    fn is_tampered(&self, tampered: &HashSet<String>, principal_id: &str) -> bool {
        tampered.contains(principal_id) || tampered.contains(&sanitize_principal_id(principal_id))
    }

    /// Mark a principal tampered in both raw and sanitized form, plus the
    /// file stem as a fallback. Audits only on first detection.
    fn mark_tampered(&self, principal_id: &str, file_path: &Path) {
        let mut tampered = self.tampered.lock().expect("tampered lock");
        let first = tampered.insert(principal_id.to_string());
        tampered.insert(sanitize_principal_id(principal_id));
        if let Some(stem) = file_path.file_stem().and_then(|s| s.to_str()) {
            tampered.insert(stem.to_string());
        }
        drop(tampered);

        if first {
            let mut details = Map::new();
            details.insert("principal_id".into(), json!(principal_id));
            details.insert("file".into(), json!(file_path.to_string_lossy()));
            self.audit.log_security_event(
                &format!("{}_grant_tampered", self.permission_type),
                AuditSeverity::Critical,
                &format!(
                    "HMAC verification failed for {} grant: {principal_id}",
                    self.permission_type
                ),
                Some(principal_id),
                details,
            );
        }
    }

    /// Read and verify one grant file. `Ok(None)` when the file does not
    /// exist; an HMAC failure marks the principal tampered and errors.
    fn load_grant(&self, principal_id: &str) -> Result<Option<Grant>, KernelError> {
        let path = self.grant_file(principal_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let Ok(Value::Object(mut data)) = serde_json::from_str::<Value>(&raw) else {
            return Err(KernelError::new(
                ErrorKind::InternalError,
                format!("grant file for '{principal_id}' is not a JSON object"),
            ));
        };

        if let Some(sig) = data
            .remove("_hmac_signature")
            .and_then(|v| v.as_str().map(str::to_string))
        {
            if !verify_data_hmac(&self.signing_key, &data, &sig) {
                let recorded = data
                    .get("principal_id")
                    .and_then(Value::as_str)
                    .unwrap_or(principal_id)
                    .to_string();
                self.mark_tampered(&recorded, &path);
                return Err(KernelError::new(
                    ErrorKind::GrantDenied,
                    format!("Grant file for '{recorded}' has been tampered with"),
                ));
            }
        }

        let grant: Grant = serde_json::from_value(Value::Object(data))?;
        Ok(Some(grant))
    }

    fn save_grant(&self, grant: &Grant) -> Result<(), KernelError> {
        let Value::Object(mut data) = serde_json::to_value(grant)? else {
            return Err(KernelError::internal("grant did not serialize to an object"));
        };
        let signature = compute_data_hmac(&self.signing_key, &data);
        data.insert("_hmac_signature".into(), json!(signature));
        rumi_core::paths::atomic_write_json(
            &self.grant_file(&grant.principal_id),
            &Value::Object(data),
            0o600,
        )
    }

    // -- Check -----------------------------------------------------------

    /// Evaluate `permission_id` for `principal_id` across its hierarchy
    /// chain. Every ancestor must hold the permission enabled; the
    /// effective config is the intersection of all ancestor configs.
    pub fn check(&self, principal_id: &str, permission_id: &str) -> GrantCheckResult {
        {
            let tampered = self.tampered.lock().expect("tampered lock");
            if self.is_tampered(&tampered, principal_id) {
                return GrantCheckResult::denied(
                    principal_id,
                    permission_id,
                    format!("Grant file for '{principal_id}' has been tampered with"),
                );
            }
        }

        let chain = parse_principal_chain(principal_id);
        let mut configs: Vec<Map<String, Value>> = Vec::with_capacity(chain.len());

        for ancestor in &chain {
            let label = if ancestor == principal_id {
                "principal"
            } else {
                "ancestor"
            };

            {
                let tampered = self.tampered.lock().expect("tampered lock");
                if self.is_tampered(&tampered, ancestor) {
                    return GrantCheckResult::denied(
                        principal_id,
                        permission_id,
                        format!("Grant file for {label} '{ancestor}' has been tampered with"),
                    );
                }
            }

            let grant = match self.load_grant(ancestor) {
                Ok(Some(grant)) => grant,
                Ok(None) => {
                    return GrantCheckResult::denied(
                        principal_id,
                        permission_id,
                        format!(
                            "No {} grant for {label} '{ancestor}'",
                            self.permission_type
                        ),
                    );
                }
                Err(e) => {
                    return GrantCheckResult::denied(principal_id, permission_id, e.message);
                }
            };

            if !grant.enabled {
                return GrantCheckResult::denied(
                    principal_id,
                    permission_id,
                    format!(
                        "{} grant for {label} '{ancestor}' is disabled",
                        self.permission_type
                    ),
                );
            }

            let Some(perm) = grant.permissions.get(permission_id) else {
                return GrantCheckResult::denied(
                    principal_id,
                    permission_id,
                    format!("Permission '{permission_id}' not granted to {label} '{ancestor}'"),
                );
            };
            if !perm.enabled {
                return GrantCheckResult::denied(
                    principal_id,
                    permission_id,
                    format!("Permission '{permission_id}' is disabled for {label} '{ancestor}'"),
                );
            }
            configs.push(perm.config.clone());
        }

        GrantCheckResult {
            allowed: true,
            reason: "Granted".into(),
            principal_id: principal_id.to_string(),
            permission_id: permission_id.to_string(),
            config: intersect_config(&configs),
        }
    }

    // -- Mutations --------------------------------------------------------

    /// Grant (or update) a permission. Rewrites the file with a fresh
    /// signature, which also repairs a previously tampered principal.
    pub fn grant_permission(
        &self,
        principal_id: &str,
        permission_id: &str,
        config: Map<String, Value>,
    ) -> Result<Grant, KernelError> {
        let now = now_ts();
        let mut grant = match self.load_grant(principal_id) {
            Ok(Some(grant)) => grant,
            // Missing, unreadable, or tampered: start a fresh grant file.
            _ => Grant {
                version: grant_version(),
                principal_id: principal_id.to_string(),
                enabled: true,
                granted_at: now.clone(),
                updated_at: now.clone(),
                permissions: BTreeMap::new(),
            },
        };

        grant.enabled = true;
        grant.updated_at = now;
        grant.permissions.insert(
            permission_id.to_string(),
            PermissionGrant {
                enabled: true,
                config,
            },
        );
        self.save_grant(&grant)?;

        {
            let mut tampered = self.tampered.lock().expect("tampered lock");
            tampered.remove(principal_id);
            tampered.remove(&sanitize_principal_id(principal_id));
        }

        self.audit_mutation(principal_id, permission_id, "grant");
        Ok(grant)
    }

    /// Disable one permission. `Ok(false)` when it was never granted.
    pub fn revoke_permission(
        &self,
        principal_id: &str,
        permission_id: &str,
    ) -> Result<bool, KernelError> {
        let Some(mut grant) = self.load_grant(principal_id)? else {
            return Ok(false);
        };
        let Some(perm) = grant.permissions.get_mut(permission_id) else {
            return Ok(false);
        };
        perm.enabled = false;
        grant.updated_at = now_ts();
        self.save_grant(&grant)?;
        self.audit_mutation(principal_id, permission_id, "revoke");
        Ok(true)
    }

    /// Disable the whole grant.
    pub fn revoke_all(&self, principal_id: &str) -> Result<bool, KernelError> {
        let Some(mut grant) = self.load_grant(principal_id)? else {
            return Ok(false);
        };
        grant.enabled = false;
        grant.updated_at = now_ts();
        self.save_grant(&grant)?;
        self.audit_mutation(principal_id, "*", "revoke_all");
        Ok(true)
    }

    /// Remove the grant file entirely.
    pub fn delete_grant(&self, principal_id: &str) -> Result<bool, KernelError> {
        let path = self.grant_file(principal_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        self.audit_mutation(principal_id, "*", "delete");
        Ok(true)
    }

    /// Read a principal's grant without hierarchy evaluation.
    pub fn get_grant(&self, principal_id: &str) -> Result<Option<Grant>, KernelError> {
        self.load_grant(principal_id)
    }

    /// Every readable grant in the directory. Tampered or unparseable
    /// files are skipped.
    pub fn list_grants(&self) -> Vec<Grant> {
        let mut out = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(&self.grants_dir) else {
            return out;
        };
        let mut stems: Vec<String> = read_dir
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some("json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        stems.sort();
        for stem in stems {
            if let Ok(Some(grant)) = self.load_grant(&stem) {
                out.push(grant);
            }
        }
        out
    }

    fn audit_mutation(&self, principal_id: &str, permission_id: &str, action: &str) {
        let mut details = Map::new();
        details.insert("principal_id".into(), json!(principal_id));
        details.insert("permission_id".into(), json!(permission_id));
        self.audit
            .log_permission_event(principal_id, self.permission_type, action, true, details, None);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
