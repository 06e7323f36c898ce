// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability executor (the C8 pipeline).
//!
//! `execute` walks the gate sequence — parse, rate limit, lazy init,
//! handler lookup, trust, grant — and only then spawns the handler in a
//! subprocess. Every early return produces one `permission` audit entry;
//! callers see the generic `"Permission denied"` for policy denials while
//! the audit entry keeps the full reason.

use crate::handler_registry::{HandlerDefinition, HandlerRegistry};
use crate::runner::{run_bounded, SubprocessSpec};
use rumi_audit::AuditLogger;
use rumi_core::ratelimit::SlidingWindowLimiter;
use rumi_core::{now_ts, ErrorKind, KernelError};
use rumi_grant::GrantManager;
use rumi_trust::TrustStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default handler wall-clock budget.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
/// Upper bound a caller may request.
pub const MAX_TIMEOUT_SECONDS: f64 = 120.0;
/// The one permission that is rate limited (runaway-loop protection).
pub const SECRET_GET_PERMISSION_ID: &str = "secrets.get";

const MAX_ARGS_SUMMARY_LENGTH: usize = 500;

/// One capability request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityRequest {
    #[serde(default)]
    pub permission_id: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Capability execution response.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityResponse {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub latency_ms: f64,
}

impl CapabilityResponse {
    fn denied(kind: ErrorKind, public_error: &str, started: Instant) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(public_error.to_string()),
            error_type: Some(kind.as_str().to_string()),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

enum RegistryState {
    Uninitialized,
    Failed,
    Ready(HandlerRegistry),
}

/// The capability execution engine.
pub struct CapabilityExecutor {
    handlers_dir: PathBuf,
    trust: Arc<TrustStore>,
    grants: Arc<GrantManager>,
    audit: Arc<AuditLogger>,
    secret_get_limiter: SlidingWindowLimiter,
    python_bin: String,
    registry: Mutex<RegistryState>,
}

impl CapabilityExecutor {
    /// Create an executor. The handler registry loads lazily on the first
    /// request; a load failure (duplicate `permission_id`) latches and
    /// every later call returns `initialization_error`.
    pub fn new(
        handlers_dir: impl Into<PathBuf>,
        trust: Arc<TrustStore>,
        grants: Arc<GrantManager>,
        audit: Arc<AuditLogger>,
        secret_get_rate_limit: u32,
        python_bin: impl Into<String>,
    ) -> Self {
        Self {
            handlers_dir: handlers_dir.into(),
            trust,
            grants,
            audit,
            secret_get_limiter: SlidingWindowLimiter::new(
                secret_get_rate_limit,
                Duration::from_secs(60),
            ),
            python_bin: python_bin.into(),
            registry: Mutex::new(RegistryState::Uninitialized),
        }
    }

    /// Run one capability request for `principal_id`.
    pub async fn execute(&self, principal_id: &str, request: CapabilityRequest) -> CapabilityResponse {
        let started = Instant::now();
        let args = request.args.unwrap_or_else(|| json!({}));
        let request_id = request.request_id.unwrap_or_default();
        let timeout = Duration::from_secs_f64(
            request
                .timeout_seconds
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
                .clamp(0.1, MAX_TIMEOUT_SECONDS),
        );

        let mut audit = AuditCtx {
            principal_id: principal_id.to_string(),
            permission_id: String::new(),
            handler_id: None,
            request_id,
            args_summary: summarize_args(&args),
            trusted: None,
            grant_allowed: None,
            grant_reason: None,
            detail_reason: None,
            extra: Map::new(),
        };

        // 1. Parse.
        let Some(permission_id) = request.permission_id.filter(|p| !p.is_empty()) else {
            let resp = CapabilityResponse::denied(
                ErrorKind::InvalidRequest,
                "Missing or invalid permission_id",
                started,
            );
            self.audit(&audit, &resp);
            return resp;
        };
        audit.permission_id = permission_id.clone();

        // 2. Rate limit, secrets.get only.
        if permission_id == SECRET_GET_PERMISSION_ID && !self.secret_get_limiter.check(principal_id)
        {
            audit.detail_reason = Some(format!(
                "Rate limit exceeded ({}/min)",
                self.secret_get_limiter.max_requests()
            ));
            let resp = CapabilityResponse::denied(ErrorKind::RateLimited, "Rate limited", started);
            self.audit(&audit, &resp);
            return resp;
        }

        // 3. Lazy init.
        let handler = match self.lookup_handler(&permission_id) {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                audit.detail_reason = Some(format!(
                    "No handler registered for permission_id '{permission_id}'"
                ));
                let resp = CapabilityResponse::denied(
                    ErrorKind::HandlerNotFound,
                    "Permission denied",
                    started,
                );
                self.audit(&audit, &resp);
                return resp;
            }
            Err(_) => {
                let resp = CapabilityResponse::denied(
                    ErrorKind::InitializationError,
                    "Capability system failed to initialize",
                    started,
                );
                self.audit(&audit, &resp);
                return resp;
            }
        };
        audit.handler_id = Some(handler.handler_id.clone());

        // 5. Trust: builtins bypass, with the computed hash recorded.
        if handler.is_builtin {
            let sha = rumi_core::paths::compute_file_sha256(&handler.entrypoint_path)
                .unwrap_or_else(|_| "compute_failed".into());
            audit.extra.insert("builtin_sha256".into(), json!(sha));
        } else {
            let actual = match rumi_core::paths::compute_file_sha256(&handler.entrypoint_path) {
                Ok(sha) => sha,
                Err(_) => {
                    audit.trusted = Some(false);
                    audit.detail_reason =
                        Some("Failed to compute handler sha256 at execution time".into());
                    let resp = CapabilityResponse::denied(
                        ErrorKind::TrustDenied,
                        "Permission denied",
                        started,
                    );
                    self.audit(&audit, &resp);
                    return resp;
                }
            };
            let trust = self.trust.is_trusted(&handler.handler_id, None, &actual, None);
            if !trust.trusted {
                audit.trusted = Some(false);
                audit.detail_reason = Some(trust.reason);
                let resp = CapabilityResponse::denied(
                    ErrorKind::TrustDenied,
                    "Permission denied",
                    started,
                );
                self.audit(&audit, &resp);
                return resp;
            }
            audit.trusted = Some(true);
        }

        // 6. Grant.
        let grant = self.grants.check(principal_id, &permission_id);
        if !grant.allowed {
            audit.grant_allowed = Some(false);
            audit.grant_reason = Some(grant.reason);
            let resp =
                CapabilityResponse::denied(ErrorKind::GrantDenied, "Permission denied", started);
            self.audit(&audit, &resp);
            return resp;
        }
        audit.grant_allowed = Some(true);
        audit.grant_reason = Some("Granted".into());

        // 7. Execute in a subprocess.
        let resp = self
            .run_handler(&handler, principal_id, &permission_id, grant.config, &args, &audit.request_id, timeout, started)
            .await;
        self.audit(&audit, &resp);
        resp
    }

    fn lookup_handler(&self, permission_id: &str) -> Result<Option<HandlerDefinition>, KernelError> {
        let mut state = self.registry.lock().expect("registry lock");
        if let RegistryState::Uninitialized = *state {
            let mut registry = HandlerRegistry::new(&self.handlers_dir, Arc::clone(&self.audit));
            let result = registry.load_all();
            if result.success {
                self.trust.load();
                *state = RegistryState::Ready(registry);
            } else {
                tracing::error!(
                    duplicates = result.duplicates.len(),
                    "capability handler registry failed to load"
                );
                *state = RegistryState::Failed;
            }
        }
        match &*state {
            RegistryState::Ready(registry) => {
                Ok(registry.get_by_permission_id(permission_id).cloned())
            }
            RegistryState::Failed => Err(KernelError::new(
                ErrorKind::InitializationError,
                "capability registry not loaded",
            )),
            RegistryState::Uninitialized => unreachable!("initialized above"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_handler(
        &self,
        handler: &HandlerDefinition,
        principal_id: &str,
        permission_id: &str,
        grant_config: Map<String, Value>,
        args: &Value,
        request_id: &str,
        timeout: Duration,
        started: Instant,
    ) -> CapabilityResponse {
        let context = json!({
            "principal_id": principal_id,
            "permission_id": permission_id,
            "handler_id": handler.handler_id,
            "grant_config": grant_config,
            "request_id": request_id,
            "ts": now_ts(),
        });
        let input = json!({ "context": context, "args": args });

        let script = generate_runner_script(
            &handler.entrypoint_path.to_string_lossy(),
            handler.entrypoint_func(),
        );
        let runner_file = match write_runner(&script) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(error = %e, "failed to write runner script");
                return CapabilityResponse::denied(
                    ErrorKind::InternalError,
                    "Internal execution error",
                    started,
                );
            }
        };

        let spec = SubprocessSpec {
            command: self.python_bin.clone(),
            args: vec![runner_file.to_string_lossy().into_owned()],
            cwd: Some(handler.handler_dir.clone()),
            input_json: input.to_string(),
            timeout,
        };

        // The TempPath guard deletes the runner on every exit path,
        // including timeout.
        let outcome = run_bounded(spec).await;
        drop(runner_file);

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(outcome) if outcome.exit_ok => CapabilityResponse {
                success: true,
                output: outcome.parse_output(),
                error: None,
                error_type: None,
                latency_ms,
            },
            Ok(_) => CapabilityResponse {
                success: false,
                output: Value::Null,
                error: Some("Handler execution failed".into()),
                error_type: Some(ErrorKind::HandlerError.as_str().into()),
                latency_ms,
            },
            Err(e) if e.kind == ErrorKind::Timeout => CapabilityResponse {
                success: false,
                output: Value::Null,
                error: Some("Handler execution timed out".into()),
                error_type: Some(ErrorKind::Timeout.as_str().into()),
                latency_ms,
            },
            Err(e) if e.kind == ErrorKind::ResponseTooLarge => CapabilityResponse {
                success: false,
                output: Value::Null,
                error: Some("Response too large".into()),
                error_type: Some(ErrorKind::ResponseTooLarge.as_str().into()),
                latency_ms,
            },
            Err(e) => {
                tracing::error!(error = %e, "handler subprocess failed");
                CapabilityResponse {
                    success: false,
                    output: Value::Null,
                    error: Some("Internal execution error".into()),
                    error_type: Some(ErrorKind::InternalError.as_str().into()),
                    latency_ms,
                }
            }
        }
    }

    fn audit(&self, ctx: &AuditCtx, resp: &CapabilityResponse) {
        let mut details = Map::new();
        details.insert("principal_id".into(), json!(ctx.principal_id));
        details.insert("permission_id".into(), json!(ctx.permission_id));
        details.insert("handler_id".into(), json!(ctx.handler_id));
        details.insert("request_id".into(), json!(ctx.request_id));
        details.insert("latency_ms".into(), json!(resp.latency_ms));
        details.insert("args_summary".into(), json!(ctx.args_summary));
        if let Some(trusted) = ctx.trusted {
            details.insert("trusted".into(), json!(trusted));
        }
        if let Some(grant_allowed) = ctx.grant_allowed {
            details.insert("grant_allowed".into(), json!(grant_allowed));
        }
        if let Some(grant_reason) = &ctx.grant_reason {
            details.insert("grant_reason".into(), json!(grant_reason));
        }
        if let Some(detail_reason) = &ctx.detail_reason {
            details.insert("detail_reason".into(), json!(detail_reason));
        }
        for (k, v) in &ctx.extra {
            details.insert(k.clone(), v.clone());
        }
        if let Some(error) = &resp.error {
            details.insert("error".into(), json!(error));
            details.insert("error_type".into(), json!(resp.error_type));
        }

        let rejection_reason = if resp.success {
            None
        } else {
            ctx.detail_reason
                .clone()
                .or_else(|| ctx.grant_reason.clone())
                .or_else(|| resp.error.clone())
        };

        self.audit.log_permission_event(
            &ctx.principal_id,
            "capability",
            "execute",
            resp.success,
            details,
            rejection_reason,
        );
    }
}

struct AuditCtx {
    principal_id: String,
    permission_id: String,
    handler_id: Option<String>,
    request_id: String,
    args_summary: String,
    trusted: Option<bool>,
    grant_allowed: Option<bool>,
    grant_reason: Option<String>,
    detail_reason: Option<String>,
    extra: Map<String, Value>,
}

fn summarize_args(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > MAX_ARGS_SUMMARY_LENGTH {
        let cut: String = s.chars().take(MAX_ARGS_SUMMARY_LENGTH).collect();
        format!("{cut}...(truncated)")
    } else {
        s
    }
}

fn write_runner(script: &str) -> Result<tempfile::TempPath, KernelError> {
    let mut file = tempfile::Builder::new()
        .prefix("rumi_runner_")
        .suffix(".py")
        .tempfile()
        .map_err(|e| KernelError::internal(format!("mkstemp: {e}")))?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// The generated runner: reads `{context, args}` from stdin, loads the
/// handler module by file path, calls the entrypoint function, and prints
/// its JSON result on stdout.
fn generate_runner_script(handler_path: &str, func_name: &str) -> String {
    let safe_path = serde_json::to_string(handler_path).expect("path encodes");
    let safe_func = serde_json::to_string(func_name).expect("func encodes");
    format!(
        r#"
import sys
import json
import importlib.util


def main():
    import os
    cwd = os.getcwd()
    if cwd not in sys.path:
        sys.path.append(cwd)

    handler_path = {safe_path}
    func_name = {safe_func}

    input_text = sys.stdin.read()
    try:
        input_data = json.loads(input_text)
    except json.JSONDecodeError:
        print(json.dumps({{"error": "Invalid input JSON", "error_type": "json_error"}}))
        sys.exit(1)

    context = input_data.get("context", {{}})
    args = input_data.get("args", {{}})

    spec = importlib.util.spec_from_file_location("handler_module", handler_path)
    if spec is None or spec.loader is None:
        print(json.dumps({{"error": "Cannot load handler module", "error_type": "load_error"}}))
        sys.exit(1)

    module = importlib.util.module_from_spec(spec)
    sys.modules["handler_module"] = module
    spec.loader.exec_module(module)

    fn = getattr(module, func_name, None)
    if fn is None:
        print(json.dumps({{"error": "Function %r not found" % func_name, "error_type": "func_not_found"}}))
        sys.exit(1)

    try:
        result = fn(context, args)
    except Exception as e:
        print(json.dumps({{"error": str(e), "error_type": type(e).__name__}}))
        sys.exit(1)

    if result is not None:
        try:
            print(json.dumps(result, ensure_ascii=False, default=str))
        except Exception:
            print(json.dumps({{"error": "Result is not JSON serializable", "error_type": "serialize_error"}}))
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
    use rumi_trust::{TrustFlavor, TrustedEntry};
    use tempfile::TempDir;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    struct Fixture {
        _dir: TempDir,
        executor: CapabilityExecutor,
        grants: Arc<GrantManager>,
        trust: Arc<TrustStore>,
        audit: Arc<AuditLogger>,
        handlers_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        let trust = Arc::new(TrustStore::new(
            dir.path().join("trusted_handlers.json"),
            TrustFlavor::Handler,
            false,
            Arc::clone(&audit),
        ));
        let grants = Arc::new(
            GrantManager::new(
                dir.path().join("capabilities"),
                "capability",
                b"cap-test-key".to_vec(),
                Arc::clone(&audit),
            )
            .unwrap(),
        );
        let handlers_dir = dir.path().join("handlers");
        let executor = CapabilityExecutor::new(
            &handlers_dir,
            Arc::clone(&trust),
            Arc::clone(&grants),
            Arc::clone(&audit),
            2,
            "python3",
        );
        Fixture {
            _dir: dir,
            executor,
            grants,
            trust,
            audit,
            handlers_dir,
        }
    }

    fn write_handler(handlers_dir: &PathBuf, slug: &str, permission_id: &str, body: &str) -> String {
        let slug_dir = handlers_dir.join(slug);
        std::fs::create_dir_all(&slug_dir).unwrap();
        std::fs::write(
            slug_dir.join("handler.json"),
            serde_json::to_string(&json!({
                "handler_id": format!("h.{slug}"),
                "permission_id": permission_id,
                "entrypoint": "handler.py:execute",
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(slug_dir.join("handler.py"), body).unwrap();
        rumi_core::paths::compute_file_sha256(&slug_dir.join("handler.py")).unwrap()
    }

    fn request(permission_id: &str) -> CapabilityRequest {
        CapabilityRequest {
            permission_id: Some(permission_id.into()),
            args: Some(json!({"path": "/tmp/x"})),
            timeout_seconds: None,
            request_id: Some("req-1".into()),
        }
    }

    #[tokio::test]
    async fn missing_permission_id_is_invalid_request() {
        let fx = fixture();
        let resp = fx.executor.execute("acme", CapabilityRequest::default()).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("invalid_request"));
    }

    #[tokio::test]
    async fn unknown_permission_collapses_to_permission_denied() {
        let fx = fixture();
        let resp = fx.executor.execute("acme", request("no.such")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("handler_not_found"));
        assert_eq!(resp.error.as_deref(), Some("Permission denied"));

        // The audit entry carries the real reason.
        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Permission),
            success: Some(false),
            ..rumi_audit::AuditQuery::new()
        });
        assert_eq!(entries.len(), 1);
        assert!(entries[0]["details"]["detail_reason"]
            .as_str()
            .unwrap()
            .contains("No handler registered"));
    }

    #[tokio::test]
    async fn untrusted_handler_is_denied_before_grant() {
        let fx = fixture();
        write_handler(
            &fx.handlers_dir,
            "writer",
            "fs.write",
            "def execute(c, a):\n    return {}\n",
        );
        fx.grants
            .grant_permission("acme", "fs.write", Map::new())
            .unwrap();

        let resp = fx.executor.execute("acme", request("fs.write")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("trust_denied"));
        assert_eq!(resp.error.as_deref(), Some("Permission denied"));
    }

    #[tokio::test]
    async fn granted_and_trusted_handler_executes() {
        if !python_available() {
            return;
        }
        let fx = fixture();
        let sha = write_handler(
            &fx.handlers_dir,
            "writer",
            "fs.write",
            "def execute(context, args):\n    return {\"bytes_written\": 2, \"principal\": context[\"principal_id\"]}\n",
        );
        fx.trust.load();
        fx.trust
            .add_trust(TrustedEntry {
                id: "h.writer".into(),
                version: None,
                sha256: sha,
                kind: "python".into(),
                note: String::new(),
            })
            .unwrap();
        fx.grants
            .grant_permission("acme", "fs.write", Map::new())
            .unwrap();

        let resp = fx.executor.execute("acme", request("fs.write")).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.output["bytes_written"], 2);
        assert_eq!(resp.output["principal"], "acme");
        assert!(resp.latency_ms >= 0.0);

        // Exactly one permission audit entry with success=true.
        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Permission),
            pack_id: Some("acme".into()),
            ..rumi_audit::AuditQuery::new()
        });
        let executes: Vec<_> = entries
            .iter()
            .filter(|e| e["action"] == "permission_execute")
            .collect();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0]["success"], true);
    }

    #[tokio::test]
    async fn missing_grant_is_denied_after_trust() {
        let fx = fixture();
        let sha = write_handler(
            &fx.handlers_dir,
            "writer",
            "fs.write",
            "def execute(c, a):\n    return {}\n",
        );
        fx.trust.load();
        fx.trust
            .add_trust(TrustedEntry {
                id: "h.writer".into(),
                version: None,
                sha256: sha,
                kind: "python".into(),
                note: String::new(),
            })
            .unwrap();

        let resp = fx.executor.execute("acme", request("fs.write")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("grant_denied"));
        assert_eq!(resp.error.as_deref(), Some("Permission denied"));
    }

    #[tokio::test]
    async fn duplicate_permission_ids_latch_initialization_error() {
        let fx = fixture();
        write_handler(&fx.handlers_dir, "a", "fs.write", "def execute(c, a):\n    return {}\n");
        write_handler(&fx.handlers_dir, "b", "fs.write", "def execute(c, a):\n    return {}\n");

        let resp = fx.executor.execute("acme", request("fs.write")).await;
        assert_eq!(resp.error_type.as_deref(), Some("initialization_error"));

        // Still latched on the next call, even for another permission.
        let resp = fx.executor.execute("acme", request("fs.read")).await;
        assert_eq!(resp.error_type.as_deref(), Some("initialization_error"));
    }

    #[tokio::test]
    async fn secrets_get_is_rate_limited_per_principal() {
        let fx = fixture();
        // Limit in the fixture is 2/min. No handler exists, so allowed
        // calls fall through to handler_not_found; the third is cut off
        // before lookup.
        for _ in 0..2 {
            let resp = fx.executor.execute("acme", request(SECRET_GET_PERMISSION_ID)).await;
            assert_eq!(resp.error_type.as_deref(), Some("handler_not_found"));
        }
        let resp = fx.executor.execute("acme", request(SECRET_GET_PERMISSION_ID)).await;
        assert_eq!(resp.error_type.as_deref(), Some("rate_limited"));

        // A different principal has its own window.
        let resp = fx.executor.execute("other", request(SECRET_GET_PERMISSION_ID)).await;
        assert_eq!(resp.error_type.as_deref(), Some("handler_not_found"));
    }

    #[tokio::test]
    async fn handler_error_and_timeout_surface_stable_kinds() {
        if !python_available() {
            return;
        }
        let fx = fixture();
        let sha_fail = write_handler(
            &fx.handlers_dir,
            "failer",
            "fs.fail",
            "def execute(c, a):\n    raise RuntimeError(\"boom\")\n",
        );
        let sha_slow = write_handler(
            &fx.handlers_dir,
            "sleeper",
            "fs.sleep",
            "import time\n\ndef execute(c, a):\n    time.sleep(30)\n",
        );
        fx.trust.load();
        for (id, sha) in [("h.failer", sha_fail), ("h.sleeper", sha_slow)] {
            fx.trust
                .add_trust(TrustedEntry {
                    id: id.into(),
                    version: None,
                    sha256: sha,
                    kind: "python".into(),
                    note: String::new(),
                })
                .unwrap();
        }
        fx.grants.grant_permission("acme", "fs.fail", Map::new()).unwrap();
        fx.grants.grant_permission("acme", "fs.sleep", Map::new()).unwrap();

        let resp = fx.executor.execute("acme", request("fs.fail")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("handler_error"));

        let mut slow = request("fs.sleep");
        slow.timeout_seconds = Some(0.5);
        let resp = fx.executor.execute("acme", slow).await;
        assert_eq!(resp.error_type.as_deref(), Some("timeout"));
    }

    #[test]
    fn args_summary_is_truncated() {
        let long = json!({"data": "x".repeat(2000)});
        let summary = summarize_args(&long);
        assert!(summary.len() < 600);
        assert!(summary.ends_with("...(truncated)"));
    }

    #[test]
    fn timeout_clamp() {
        // Request far beyond the cap clamps to MAX_TIMEOUT_SECONDS.
        let requested: f64 = 1000.0;
        assert_eq!(
            requested.clamp(0.1, MAX_TIMEOUT_SECONDS),
            MAX_TIMEOUT_SECONDS
        );
    }
}
