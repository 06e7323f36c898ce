// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unit executor (the C9 pipeline).
//!
//! Same gates as the capability executor plus the unit-specific ones:
//! pack approval with content-hash verification, execution-mode and kind
//! whitelists, and the TOCTOU defense — after the trust check the
//! entrypoint bytes are read into memory, re-hashed, and the exact bytes
//! that hashed correctly are written to a read-only temp file which is
//! what actually runs.

use crate::runner::{run_bounded, SubprocessSpec};
use crate::unit_registry::{UnitRegistry, ALLOWED_KINDS};
use rumi_approval::ApprovalManager;
use rumi_audit::AuditLogger;
use rumi_core::{ErrorKind, KernelError};
use rumi_grant::GrantManager;
use rumi_store::StoreRegistry;
use rumi_trust::TrustStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default unit wall-clock budget.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 60.0;
/// Upper bound a caller may request.
pub const MAX_TIMEOUT_SECONDS: f64 = 300.0;

/// Address of a unit: `(store_id, unit_id, version)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitRef {
    pub store_id: String,
    pub unit_id: String,
    pub version: String,
}

/// Unit execution response.
#[derive(Debug, Clone, Serialize)]
pub struct UnitExecutionResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub execution_mode: String,
    pub latency_ms: f64,
}

/// The unit execution engine.
pub struct UnitExecutor {
    approval: Arc<ApprovalManager>,
    stores: Arc<StoreRegistry>,
    units: UnitRegistry,
    trust: Arc<TrustStore>,
    grants: Arc<GrantManager>,
    audit: Arc<AuditLogger>,
    python_bin: String,
}

impl UnitExecutor {
    pub fn new(
        approval: Arc<ApprovalManager>,
        stores: Arc<StoreRegistry>,
        trust: Arc<TrustStore>,
        grants: Arc<GrantManager>,
        audit: Arc<AuditLogger>,
        python_bin: impl Into<String>,
    ) -> Self {
        Self {
            approval,
            stores,
            units: UnitRegistry,
            trust,
            grants,
            audit,
            python_bin: python_bin.into(),
        }
    }

    /// Execute a unit for `principal_id`.
    pub async fn execute(
        &self,
        principal_id: &str,
        unit_ref: &UnitRef,
        mode: &str,
        args: &Value,
        timeout_seconds: f64,
    ) -> UnitExecutionResult {
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(timeout_seconds.clamp(0.1, MAX_TIMEOUT_SECONDS));

        // 0. Shape checks.
        if principal_id.is_empty() {
            return self.denied(
                ErrorKind::InvalidRequest,
                "Missing principal_id",
                started,
                mode,
                principal_id,
                unit_ref,
            );
        }
        if unit_ref.store_id.is_empty() || unit_ref.unit_id.is_empty() || unit_ref.version.is_empty()
        {
            return self.denied(
                ErrorKind::InvalidRequest,
                "Missing store_id, unit_id, or version",
                started,
                mode,
                principal_id,
                unit_ref,
            );
        }

        // 1. Pack approval + content-hash verification.
        let (approved, reason) = self.approval.is_pack_approved_and_verified(principal_id);
        if !approved {
            return self.denied(
                ErrorKind::ApprovalDenied,
                &format!("Pack not approved: {reason}"),
                started,
                mode,
                principal_id,
                unit_ref,
            );
        }

        // 2. Resolve the store and the unit.
        let store = match self.stores.get_store(&unit_ref.store_id) {
            Ok(Some(store)) => store,
            Ok(None) => {
                return self.denied(
                    ErrorKind::StoreNotFound,
                    &format!("Store not found: {}", unit_ref.store_id),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }
            Err(e) => {
                return self.denied(
                    ErrorKind::InternalError,
                    &format!("Store resolution failed: {e}"),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }
        };
        let unit = match self
            .units
            .get_unit(Path::new(&store.root_path), &unit_ref.unit_id, &unit_ref.version)
        {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                return self.denied(
                    ErrorKind::InvalidRequest,
                    &format!("Unit not found: {} v{}", unit_ref.unit_id, unit_ref.version),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }
            Err(e) => {
                return self.denied(
                    e.kind,
                    &format!("Unit resolution failed: {e}"),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }
        };

        // 3. Mode must be declared by the unit.
        if !unit.exec_modes_allowed.iter().any(|m| m == mode) {
            return self.denied(
                ErrorKind::ModeNotAllowed,
                &format!(
                    "Mode '{mode}' not in exec_modes_allowed: {:?}",
                    unit.exec_modes_allowed
                ),
                started,
                mode,
                principal_id,
                unit_ref,
            );
        }

        // 4. Hierarchical grant on the unit's permission.
        if let Some(permission_id) = &unit.permission_id {
            let grant = self.grants.check(principal_id, permission_id);
            if !grant.allowed {
                return self.denied(
                    ErrorKind::GrantDenied,
                    &format!("Permission denied: {}", grant.reason),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }
        }

        // 4.5. Kind whitelist.
        if !ALLOWED_KINDS.contains(&unit.kind.as_str()) {
            return self.denied(
                ErrorKind::UnknownKind,
                &format!("Unknown kind: {}", unit.kind),
                started,
                mode,
                principal_id,
                unit_ref,
            );
        }

        // 5 + 5.5. Trust and TOCTOU verification for executable kinds.
        let mut verified: Option<(Vec<u8>, String)> = None;
        if matches!(unit.kind.as_str(), "python" | "binary") {
            let Some(entrypoint) = &unit.entrypoint else {
                return self.denied(
                    ErrorKind::MissingEntrypoint,
                    "No entrypoint for executable unit",
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            };
            let actual = match self.units.compute_entrypoint_sha256(&unit.unit_dir, entrypoint) {
                Ok(sha) => sha,
                Err(e) => {
                    return self.denied(
                        e.kind,
                        &format!("Failed to compute entrypoint sha256: {e}"),
                        started,
                        mode,
                        principal_id,
                        unit_ref,
                    );
                }
            };
            if !self.trust.is_loaded() {
                self.trust.load();
            }
            let trust = self.trust.is_trusted(
                &unit_ref.unit_id,
                Some(&unit_ref.version),
                &actual,
                Some(&unit.kind),
            );
            if !trust.trusted {
                return self.denied(
                    ErrorKind::TrustDenied,
                    &format!("Unit trust denied: {}", trust.reason),
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }

            // Read the exact bytes that will execute and re-hash them.
            let ep_path = unit.unit_dir.join(entrypoint);
            let content = match std::fs::read(&ep_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return self.denied(
                        ErrorKind::InternalError,
                        &format!("Failed to read entrypoint for verification: {e}"),
                        started,
                        mode,
                        principal_id,
                        unit_ref,
                    );
                }
            };
            if rumi_core::paths::compute_bytes_sha256(&content) != actual {
                return self.denied(
                    ErrorKind::ToctouMismatch,
                    "Entrypoint content changed after trust check",
                    started,
                    mode,
                    principal_id,
                    unit_ref,
                );
            }

            // Binaries must not carry setuid/setgid on the original file.
            #[cfg(unix)]
            if unit.kind == "binary" {
                use std::os::unix::fs::PermissionsExt;
                match std::fs::metadata(&ep_path) {
                    Ok(meta) => {
                        if meta.permissions().mode() & 0o6000 != 0 {
                            return self.denied(
                                ErrorKind::SecurityViolation,
                                "Entrypoint has setuid/setgid bits set",
                                started,
                                mode,
                                principal_id,
                                unit_ref,
                            );
                        }
                    }
                    Err(e) => {
                        return self.denied(
                            ErrorKind::InternalError,
                            &format!("Failed to stat entrypoint: {e}"),
                            started,
                            mode,
                            principal_id,
                            unit_ref,
                        );
                    }
                }
            }

            verified = Some((content, actual));
        }

        // 6. Execute.
        let result = match mode {
            "host_capability" => {
                self.execute_host(&unit, args, timeout, started, verified).await
            }
            "pack_container" | "sandbox" => UnitExecutionResult {
                success: false,
                output: Value::Null,
                error: Some(format!("Mode '{mode}' is not yet implemented")),
                error_type: Some(ErrorKind::ModeNotImplemented.as_str().into()),
                execution_mode: mode.to_string(),
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
            other => UnitExecutionResult {
                success: false,
                output: Value::Null,
                error: Some(format!("Unknown mode: {other}")),
                error_type: Some(ErrorKind::InvalidRequest.as_str().into()),
                execution_mode: other.to_string(),
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
        };

        self.audit_execution(principal_id, unit_ref, mode, &result);
        result
    }

    async fn execute_host(
        &self,
        unit: &crate::unit_registry::UnitMeta,
        args: &Value,
        timeout: Duration,
        started: Instant,
        verified: Option<(Vec<u8>, String)>,
    ) -> UnitExecutionResult {
        let fail = |kind: ErrorKind, error: &str| UnitExecutionResult {
            success: false,
            output: Value::Null,
            error: Some(error.to_string()),
            error_type: Some(kind.as_str().to_string()),
            execution_mode: "host_capability".into(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        if unit.kind == "data" {
            return fail(
                ErrorKind::InvalidRequest,
                "data units are not executable",
            );
        }
        let Some((content, _)) = verified else {
            return fail(ErrorKind::InternalError, "missing verified entrypoint bytes");
        };

        // The verified bytes land in a fresh 0500 temp file; that file is
        // what executes, so a post-check swap of the original is inert.
        let verified_file = match write_verified(&content, unit.kind == "python") {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(error = %e, "failed to stage verified entrypoint");
                return fail(ErrorKind::InternalError, "Internal execution error");
            }
        };

        let input_json = json!({ "args": args }).to_string();
        let spec = if unit.kind == "python" {
            let script = generate_unit_runner(&verified_file.to_string_lossy());
            let runner_file = match write_runner(&script) {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(error = %e, "failed to write unit runner");
                    return fail(ErrorKind::InternalError, "Internal execution error");
                }
            };
            let spec = SubprocessSpec {
                command: self.python_bin.clone(),
                args: vec![runner_file.to_string_lossy().into_owned()],
                cwd: Some(unit.unit_dir.clone()),
                input_json,
                timeout,
            };
            // Keep both temp files alive until the subprocess finishes.
            let outcome = run_bounded(spec).await;
            drop(runner_file);
            drop(verified_file);
            return self.finish(outcome, started);
        } else {
            SubprocessSpec {
                command: verified_file.to_string_lossy().into_owned(),
                args: Vec::new(),
                cwd: Some(unit.unit_dir.clone()),
                input_json,
                timeout,
            }
        };

        let outcome = run_bounded(spec).await;
        drop(verified_file);
        self.finish(outcome, started)
    }

    fn finish(
        &self,
        outcome: Result<crate::runner::SubprocessOutcome, KernelError>,
        started: Instant,
    ) -> UnitExecutionResult {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(outcome) if outcome.exit_ok => UnitExecutionResult {
                success: true,
                output: outcome.parse_output(),
                error: None,
                error_type: None,
                execution_mode: "host_capability".into(),
                latency_ms,
            },
            Ok(outcome) => UnitExecutionResult {
                success: false,
                output: Value::Null,
                error: Some(
                    outcome
                        .stderr_head
                        .map(|head| format!("Unit execution failed: {head}"))
                        .unwrap_or_else(|| "Unit execution failed".into()),
                ),
                error_type: Some(ErrorKind::HandlerError.as_str().into()),
                execution_mode: "host_capability".into(),
                latency_ms,
            },
            Err(e) if e.kind == ErrorKind::Timeout => UnitExecutionResult {
                success: false,
                output: Value::Null,
                error: Some(e.message),
                error_type: Some(ErrorKind::Timeout.as_str().into()),
                execution_mode: "host_capability".into(),
                latency_ms,
            },
            Err(e) if e.kind == ErrorKind::ResponseTooLarge => UnitExecutionResult {
                success: false,
                output: Value::Null,
                error: Some("Response too large".into()),
                error_type: Some(ErrorKind::ResponseTooLarge.as_str().into()),
                execution_mode: "host_capability".into(),
                latency_ms,
            },
            Err(e) => {
                tracing::error!(error = %e, "unit subprocess failed");
                UnitExecutionResult {
                    success: false,
                    output: Value::Null,
                    error: Some("Internal execution error".into()),
                    error_type: Some(ErrorKind::InternalError.as_str().into()),
                    execution_mode: "host_capability".into(),
                    latency_ms,
                }
            }
        }
    }

    fn denied(
        &self,
        kind: ErrorKind,
        error: &str,
        started: Instant,
        mode: &str,
        principal_id: &str,
        unit_ref: &UnitRef,
    ) -> UnitExecutionResult {
        let result = UnitExecutionResult {
            success: false,
            output: Value::Null,
            error: Some(error.to_string()),
            error_type: Some(kind.as_str().to_string()),
            execution_mode: mode.to_string(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        self.audit_execution(principal_id, unit_ref, mode, &result);
        result
    }

    fn audit_execution(
        &self,
        principal_id: &str,
        unit_ref: &UnitRef,
        mode: &str,
        result: &UnitExecutionResult,
    ) {
        let mut details = Map::new();
        details.insert("unit_ref".into(), json!(unit_ref));
        details.insert("mode".into(), json!(mode));
        details.insert("latency_ms".into(), json!(result.latency_ms));
        details.insert("error_type".into(), json!(result.error_type));
        self.audit.log_permission_event(
            principal_id,
            "unit_execution",
            "execute",
            result.success,
            details,
            if result.success {
                None
            } else {
                result.error.clone()
            },
        );
    }
}

fn write_runner(script: &str) -> Result<tempfile::TempPath, KernelError> {
    let mut file = tempfile::Builder::new()
        .prefix("rumi_unit_runner_")
        .suffix(".py")
        .tempfile()
        .map_err(|e| KernelError::internal(format!("mkstemp: {e}")))?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Write verified entrypoint bytes to a 0500 temp file.
///
/// The write handle is closed before the path is handed out: executing a
/// file that is still open for writing fails with ETXTBSY.
fn write_verified(content: &[u8], is_python: bool) -> Result<tempfile::TempPath, KernelError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("rumi_verified_ep_");
    if is_python {
        builder.suffix(".py");
    }
    let mut file = builder
        .tempfile()
        .map_err(|e| KernelError::internal(format!("mkstemp: {e}")))?;
    file.write_all(content)?;
    file.flush()?;
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o500))?;
    }
    Ok(path)
}

/// Runner for python units: the verified file exposes `execute`, `run`,
/// or `main` taking the args dict.
fn generate_unit_runner(verified_path: &str) -> String {
    let safe_path = serde_json::to_string(verified_path).expect("path encodes");
    format!(
        r#"
import sys, json, importlib.util


def main():
    input_data = json.loads(sys.stdin.read())
    args = input_data.get("args", {{}})

    spec = importlib.util.spec_from_file_location("unit_module", {safe_path})
    if spec is None or spec.loader is None:
        print(json.dumps({{"error": "Cannot load module"}}))
        sys.exit(1)

    module = importlib.util.module_from_spec(spec)
    sys.modules["unit_module"] = module
    spec.loader.exec_module(module)

    fn = getattr(module, "execute", None) or getattr(module, "run", None) or getattr(module, "main", None)
    if fn is None:
        print(json.dumps({{"error": "No execute/run/main function"}}))
        sys.exit(1)

    try:
        result = fn(args)
    except Exception as e:
        print(json.dumps({{"error": str(e)}}))
        sys.exit(1)

    if result is not None:
        try:
            print(json.dumps(result, ensure_ascii=False, default=str))
        except Exception:
            print(json.dumps({{"error": "Result not serializable"}}))
            sys.exit(1)


if __name__ == "__main__":
    main()
"#
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_registry::UnitMeta;
    use rumi_trust::{TrustFlavor, TrustedEntry};
    use tempfile::TempDir;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    struct Fixture {
        dir: TempDir,
        executor: UnitExecutor,
        stores: Arc<StoreRegistry>,
        trust: Arc<TrustStore>,
        grants: Arc<GrantManager>,
        approval: Arc<ApprovalManager>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        let stores = Arc::new(
            StoreRegistry::new(
                dir.path().join("stores/stores.db"),
                dir.path().join("stores"),
                Arc::clone(&audit),
            )
            .unwrap(),
        );
        let trust = Arc::new(TrustStore::new(
            dir.path().join("trusted_units.json"),
            TrustFlavor::Unit,
            false,
            Arc::clone(&audit),
        ));
        let grants = Arc::new(
            GrantManager::new(
                dir.path().join("capabilities"),
                "capability",
                b"unit-test-key".to_vec(),
                Arc::clone(&audit),
            )
            .unwrap(),
        );
        let approval = Arc::new(
            ApprovalManager::new(
                dir.path().join("ecosystem"),
                dir.path().join("approvals.json"),
                Arc::clone(&audit),
            )
            .unwrap(),
        );
        let executor = UnitExecutor::new(
            Arc::clone(&approval),
            Arc::clone(&stores),
            Arc::clone(&trust),
            Arc::clone(&grants),
            audit,
            "python3",
        );
        Fixture {
            dir,
            executor,
            stores,
            trust,
            grants,
            approval,
        }
    }

    fn approve_pack(fx: &Fixture, pack_id: &str) {
        let pack_dir = fx.dir.path().join("ecosystem").join(pack_id);
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(pack_dir.join("pack.json"), format!("{{\"pack_id\": \"{pack_id}\"}}")).unwrap();
        fx.approval.scan_packs().unwrap();
        fx.approval.approve(pack_id).unwrap();
    }

    /// Publish a python unit and trust its entrypoint; returns its dir.
    fn publish_unit(fx: &Fixture, body: &str, permission: Option<&str>) -> PathBuf {
        let store = fx.stores.create_store("units", None, "test").unwrap();
        let registry = UnitRegistry;
        let meta = UnitMeta {
            unit_id: "tools/echo".into(),
            version: "1.0.0".into(),
            kind: "python".into(),
            entrypoint: Some("main.py".into()),
            exec_modes_allowed: vec!["host_capability".into()],
            permission_id: permission.map(str::to_string),
            unit_dir: PathBuf::new(),
        };
        let unit_dir = registry
            .publish_unit(Path::new(&store.root_path), &meta)
            .unwrap();
        std::fs::write(unit_dir.join("main.py"), body).unwrap();

        let sha = registry
            .compute_entrypoint_sha256(&unit_dir, "main.py")
            .unwrap();
        fx.trust.load();
        fx.trust
            .add_trust(TrustedEntry {
                id: "tools/echo".into(),
                version: Some("1.0.0".into()),
                sha256: sha,
                kind: "python".into(),
                note: String::new(),
            })
            .unwrap();
        unit_dir
    }

    fn unit_ref() -> UnitRef {
        UnitRef {
            store_id: "units".into(),
            unit_id: "tools/echo".into(),
            version: "1.0.0".into(),
        }
    }

    #[tokio::test]
    async fn unapproved_pack_is_denied_first() {
        let fx = fixture();
        publish_unit(&fx, "def execute(args):\n    return args\n", None);

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "host_capability", &json!({}), 10.0)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("approval_denied"));
    }

    #[tokio::test]
    async fn mode_must_be_declared() {
        let fx = fixture();
        approve_pack(&fx, "acme");
        publish_unit(&fx, "def execute(args):\n    return args\n", None);

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "sandbox", &json!({}), 10.0)
            .await;
        assert_eq!(result.error_type.as_deref(), Some("mode_not_allowed"));
    }

    #[tokio::test]
    async fn reserved_modes_return_not_implemented() {
        let fx = fixture();
        approve_pack(&fx, "acme");
        // Publish a unit that allows the reserved mode.
        let store = fx.stores.create_store("units", None, "test").unwrap();
        let registry = UnitRegistry;
        let meta = UnitMeta {
            unit_id: "tools/echo".into(),
            version: "1.0.0".into(),
            kind: "data".into(),
            entrypoint: None,
            exec_modes_allowed: vec!["pack_container".into()],
            permission_id: None,
            unit_dir: PathBuf::new(),
        };
        registry.publish_unit(Path::new(&store.root_path), &meta).unwrap();

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "pack_container", &json!({}), 10.0)
            .await;
        assert_eq!(result.error_type.as_deref(), Some("mode_not_implemented"));
    }

    #[tokio::test]
    async fn grant_is_required_when_the_unit_declares_one() {
        let fx = fixture();
        approve_pack(&fx, "acme");
        publish_unit(&fx, "def execute(args):\n    return args\n", Some("unit.run"));

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "host_capability", &json!({}), 10.0)
            .await;
        assert_eq!(result.error_type.as_deref(), Some("grant_denied"));

        fx.grants.grant_permission("acme", "unit.run", Map::new()).unwrap();
        if python_available() {
            let result = fx
                .executor
                .execute("acme", &unit_ref(), "host_capability", &json!({"v": 7}), 10.0)
                .await;
            assert!(result.success, "{:?}", result.error);
            assert_eq!(result.output, json!({"v": 7}));
            assert_eq!(result.execution_mode, "host_capability");
        }
    }

    #[tokio::test]
    async fn untrusted_unit_is_denied() {
        let fx = fixture();
        approve_pack(&fx, "acme");
        let unit_dir = publish_unit(&fx, "def execute(args):\n    return args\n", None);
        // Swap the entrypoint after trusting: hash no longer matches.
        std::fs::write(unit_dir.join("main.py"), "def execute(args):\n    return 'evil'\n").unwrap();

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "host_capability", &json!({}), 10.0)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("trust_denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn setgid_binary_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture();
        approve_pack(&fx, "acme");

        let store = fx.stores.create_store("units", None, "test").unwrap();
        let registry = UnitRegistry;
        let meta = UnitMeta {
            unit_id: "tools/echo".into(),
            version: "1.0.0".into(),
            kind: "binary".into(),
            entrypoint: Some("tool".into()),
            exec_modes_allowed: vec!["host_capability".into()],
            permission_id: None,
            unit_dir: PathBuf::new(),
        };
        let unit_dir = registry.publish_unit(Path::new(&store.root_path), &meta).unwrap();
        let bin = unit_dir.join("tool");
        std::fs::write(&bin, "#!/bin/sh\ncat\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o2755)).unwrap();

        let sha = registry.compute_entrypoint_sha256(&unit_dir, "tool").unwrap();
        fx.trust.load();
        fx.trust
            .add_trust(TrustedEntry {
                id: "tools/echo".into(),
                version: Some("1.0.0".into()),
                sha256: sha,
                kind: "binary".into(),
                note: String::new(),
            })
            .unwrap();

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "host_capability", &json!({}), 10.0)
            .await;
        assert_eq!(result.error_type.as_deref(), Some("security_violation"));
    }

    #[tokio::test]
    async fn timeout_is_clamped_to_the_cap() {
        // A request for 1000s clamps to 300s.
        let requested: f64 = 1000.0;
        assert_eq!(requested.clamp(0.1, MAX_TIMEOUT_SECONDS), 300.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binary_unit_executes_verified_bytes() {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture();
        approve_pack(&fx, "acme");

        let store = fx.stores.create_store("units", None, "test").unwrap();
        let registry = UnitRegistry;
        let meta = UnitMeta {
            unit_id: "tools/echo".into(),
            version: "1.0.0".into(),
            kind: "binary".into(),
            entrypoint: Some("tool".into()),
            exec_modes_allowed: vec!["host_capability".into()],
            permission_id: None,
            unit_dir: PathBuf::new(),
        };
        let unit_dir = registry.publish_unit(Path::new(&store.root_path), &meta).unwrap();
        let bin = unit_dir.join("tool");
        std::fs::write(&bin, "#!/bin/sh\necho '{\"ran\": true}'\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sha = registry.compute_entrypoint_sha256(&unit_dir, "tool").unwrap();
        fx.trust.load();
        fx.trust
            .add_trust(TrustedEntry {
                id: "tools/echo".into(),
                version: Some("1.0.0".into()),
                sha256: sha,
                kind: "binary".into(),
                note: String::new(),
            })
            .unwrap();

        let result = fx
            .executor
            .execute("acme", &unit_ref(), "host_capability", &json!({}), 10.0)
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!({"ran": true}));
    }
}
