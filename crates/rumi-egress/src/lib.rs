// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-egress
//!
//! Per-pack egress proxy. Each pack gets its own Unix domain socket at
//! `egress/<sha256(pack_id)[:32]>.sock`; the pack's identity is
//! established by which socket it connected to, never by anything in the
//! payload. Frames are 4-byte big-endian length-prefixed JSON.

#![deny(unsafe_code)]

mod domain;
mod gate;
mod ip;
mod protocol;

pub use domain::DomainRules;
pub use gate::{EgressGate, GateConfig, DEFAULT_TIMEOUT_SECONDS, MAX_REDIRECT_HOPS, MAX_TIMEOUT_SECONDS};
pub use ip::{default_blocked_networks, is_internal_ip};
pub use protocol::{
    read_frame, write_frame, EgressRequest, EgressResponse, ALLOWED_METHODS, MAX_FRAME_BYTES,
};

use rumi_core::KernelError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{UnixListener, UnixStream};

/// The per-pack socket server.
pub struct EgressProxy {
    egress_dir: PathBuf,
    gate: Arc<EgressGate>,
    world_rw: bool,
}

/// A live per-pack socket. Dropping it stops the accept loop and removes
/// the socket file.
pub struct EgressSocket {
    pub pack_id: String,
    pub path: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for EgressSocket {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl EgressProxy {
    /// Create a proxy serving sockets under `egress_dir`.
    ///
    /// `world_rw` relaxes the socket mode from 0660 to 0666 (env-gated by
    /// the daemon; never controlled by a request).
    pub fn new(
        egress_dir: impl Into<PathBuf>,
        gate: Arc<EgressGate>,
        world_rw: bool,
    ) -> Result<Self, KernelError> {
        let egress_dir = egress_dir.into();
        std::fs::create_dir_all(&egress_dir)?;
        Ok(Self {
            egress_dir,
            gate,
            world_rw,
        })
    }

    /// Deterministic socket path for a pack. Hashing the pack id avoids
    /// both filesystem-unsafe names and collisions between similar ids.
    pub fn socket_path(&self, pack_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(pack_id.as_bytes());
        let digest = hasher.finalize();
        let mut name = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            name.push_str(&format!("{byte:02x}"));
        }
        self.egress_dir.join(format!("{name}.sock"))
    }

    /// Bind the pack's socket and start serving its requests.
    pub fn start_for_pack(&self, pack_id: &str) -> Result<EgressSocket, KernelError> {
        let path = self.socket_path(pack_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| KernelError::internal(format!("bind {path:?}: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if self.world_rw { 0o666 } else { 0o660 };
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }

        let gate = Arc::clone(&self.gate);
        let pack = pack_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let gate = Arc::clone(&gate);
                        let pack = pack.clone();
                        tokio::spawn(async move {
                            serve_connection(gate, pack, stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "egress accept failed");
                        break;
                    }
                }
            }
        });

        tracing::info!(pack_id, path = %path.display(), "egress socket listening");
        Ok(EgressSocket {
            pack_id: pack_id.to_string(),
            path,
            task,
        })
    }
}

async fn serve_connection(gate: Arc<EgressGate>, pack_id: String, mut stream: UnixStream) {
    loop {
        let started = Instant::now();
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // EOF or a broken frame ends the connection.
            Err(_) => return,
        };
        let response = match serde_json::from_value::<EgressRequest>(frame) {
            Ok(request) => gate.handle(&pack_id, request).await,
            Err(e) => gate::internal_error_response(
                &KernelError::invalid(format!("invalid egress request: {e}")),
                started,
            ),
        };
        if write_frame(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rumi_audit::AuditLogger;
    use rumi_grant::GrantManager;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        grants: Arc<GrantManager>,
        audit: Arc<AuditLogger>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path().join("audit")));
        let grants = Arc::new(
            GrantManager::new(
                dir.path().join("network"),
                "network",
                b"egress-test-key".to_vec(),
                Arc::clone(&audit),
            )
            .unwrap(),
        );
        Fixture { dir, grants, audit }
    }

    fn gate_with(fx: &Fixture, config: GateConfig) -> Arc<EgressGate> {
        Arc::new(EgressGate::new(
            config,
            Arc::clone(&fx.grants),
            Arc::clone(&fx.audit),
            fx.dir.path().join("ecosystem"),
        ))
    }

    fn get_request(url: &str) -> EgressRequest {
        serde_json::from_value(json!({
            "method": "GET",
            "url": url,
            "headers": {},
            "body": null,
            "timeout_seconds": 10.0,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn internal_ip_literal_is_blocked_before_grant() {
        let fx = fixture();
        // Even a grant that allows everything cannot open loopback.
        fx.grants
            .grant_permission("acme", "127.0.0.1:80", Map::new())
            .unwrap();
        let gate = gate_with(&fx, GateConfig::default());

        let resp = gate.handle("acme", get_request("http://127.0.0.1/steal")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("security_violation"));

        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Network),
            success: Some(false),
            ..rumi_audit::AuditQuery::new()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["rejection_reason"], "internal_ip_blocked");
        assert_eq!(entries[0]["details"]["allowed"], false);
    }

    #[tokio::test]
    async fn dns_rebind_to_loopback_is_blocked() {
        let fx = fixture();
        fx.grants
            .grant_permission("acme", "localhost:443", Map::new())
            .unwrap();
        let gate = gate_with(&fx, GateConfig::default());

        let resp = gate.handle("acme", get_request("https://localhost/")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("security_violation"));

        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Network),
            ..rumi_audit::AuditQuery::new()
        });
        assert_eq!(entries[0]["rejection_reason"], "dns_resolves_internal");
    }

    #[tokio::test]
    async fn missing_grant_denies_after_ip_checks() {
        let fx = fixture();
        // Loopback unblocked so the gate reaches the grant check.
        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                ..GateConfig::default()
            },
        );

        let resp = gate.handle("acme", get_request("http://127.0.0.1:9/")).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("grant_denied"));
        assert_eq!(resp.error.as_deref(), Some("Request blocked"));
    }

    #[tokio::test]
    async fn granted_request_reaches_the_server() {
        let fx = fixture();
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/data"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(json!({"ok": true})),
            )
            .mount(&server)
            .await;

        let url = format!("{}/data", server.uri());
        let parsed = reqwest::Url::parse(&url).unwrap();
        let host_port = format!(
            "{}:{}",
            parsed.host_str().unwrap(),
            parsed.port_or_known_default().unwrap()
        );
        fx.grants.grant_permission("acme", &host_port, Map::new()).unwrap();

        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                ..GateConfig::default()
            },
        );
        let resp = gate.handle("acme", get_request(&url)).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.status_code, Some(200));
        assert_eq!(resp.redirect_hops, 0);
        assert!(resp.bytes_read > 0);
        assert!(resp.body.unwrap().contains("ok"));
    }

    #[tokio::test]
    async fn oversized_response_fails_not_truncates() {
        let fx = fixture();
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64 * 1024]),
            )
            .mount(&server)
            .await;

        let parsed = reqwest::Url::parse(&server.uri()).unwrap();
        let host_port = format!(
            "{}:{}",
            parsed.host_str().unwrap(),
            parsed.port_or_known_default().unwrap()
        );
        fx.grants.grant_permission("acme", &host_port, Map::new()).unwrap();

        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                max_response_bytes: 1024,
                ..GateConfig::default()
            },
        );
        let resp = gate.handle("acme", get_request(&format!("{}/big", server.uri()))).await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("response_too_large"));
        assert!(resp.body.is_none(), "no partial body may escape");
    }

    #[tokio::test]
    async fn redirects_are_followed_with_regating_up_to_the_cap() {
        let fx = fixture();
        let server = wiremock::MockServer::start().await;
        let base = server.uri();
        wiremock::Mock::given(wiremock::matchers::path("/hop1"))
            .respond_with(
                wiremock::ResponseTemplate::new(302)
                    .insert_header("Location", format!("{base}/hop2").as_str()),
            )
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::path("/hop2"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("landed"))
            .mount(&server)
            .await;

        let parsed = reqwest::Url::parse(&base).unwrap();
        let host_port = format!(
            "{}:{}",
            parsed.host_str().unwrap(),
            parsed.port_or_known_default().unwrap()
        );
        fx.grants.grant_permission("acme", &host_port, Map::new()).unwrap();

        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                ..GateConfig::default()
            },
        );
        let resp = gate.handle("acme", get_request(&format!("{base}/hop1"))).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.redirect_hops, 1);
        assert!(resp.final_url.unwrap().ends_with("/hop2"));

        // A redirect loop exhausts the hop budget.
        wiremock::Mock::given(wiremock::matchers::path("/loop"))
            .respond_with(
                wiremock::ResponseTemplate::new(302)
                    .insert_header("Location", format!("{base}/loop").as_str()),
            )
            .mount(&server)
            .await;
        let resp = gate.handle("acme", get_request(&format!("{base}/loop"))).await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_pack() {
        let fx = fixture();
        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                rate_limit_per_min: 1,
                ..GateConfig::default()
            },
        );

        // First request passes the limiter (then dies on grant), second is
        // rate limited before the grant check.
        let first = gate.handle("acme", get_request("http://127.0.0.1:9/")).await;
        assert_eq!(first.error_type.as_deref(), Some("grant_denied"));
        let second = gate.handle("acme", get_request("http://127.0.0.1:9/")).await;
        assert_eq!(second.error_type.as_deref(), Some("rate_limited"));
        // Another pack is unaffected.
        let other = gate.handle("globex", get_request("http://127.0.0.1:9/")).await;
        assert_eq!(other.error_type.as_deref(), Some("grant_denied"));
    }

    #[tokio::test]
    async fn pack_domain_rules_are_enforced() {
        let fx = fixture();
        let pack_dir = fx.dir.path().join("ecosystem/acme");
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(
            pack_dir.join("pack.json"),
            serde_json::to_string(&json!({
                "pack_id": "acme",
                "egress": {"allowed_domains": ["allowed.test"], "blocked_domains": []}
            }))
            .unwrap(),
        )
        .unwrap();

        let gate = gate_with(
            &fx,
            GateConfig {
                blocked_networks: Vec::new(),
                ..GateConfig::default()
            },
        );
        // 127.0.0.1 is an IP literal, not in the allowlist → the domain
        // check never applies to literals, so use a hostname instead.
        let resp = gate.handle("acme", get_request("http://localhost:9/")).await;
        assert!(!resp.success);
        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Network),
            ..rumi_audit::AuditQuery::new()
        });
        assert_eq!(entries[0]["rejection_reason"], "domain_not_allowed");
    }

    #[tokio::test]
    async fn socket_roundtrip_identifies_the_pack_by_socket() {
        let fx = fixture();
        let gate = gate_with(&fx, GateConfig::default());
        let proxy = EgressProxy::new(fx.dir.path().join("egress"), gate, false).unwrap();
        let socket = proxy.start_for_pack("acme").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&socket.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o660);
        }

        let mut stream = UnixStream::connect(&socket.path).await.unwrap();
        // The payload claims a different pack; the socket wins.
        write_frame(
            &mut stream,
            &json!({
                "method": "GET",
                "url": "http://127.0.0.1/x",
                "pack_id": "someone-else",
            }),
        )
        .await
        .unwrap();
        let response = read_frame(&mut stream).await.unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error_type"], "security_violation");

        let entries = fx.audit.query(&rumi_audit::AuditQuery {
            category: Some(rumi_audit::AuditCategory::Network),
            ..rumi_audit::AuditQuery::new()
        });
        assert_eq!(entries[0]["owner_pack"], "acme");
    }

    #[test]
    fn socket_paths_are_hashed_and_distinct() {
        let fx = fixture();
        let gate = gate_with(&fx, GateConfig::default());
        let proxy = EgressProxy::new(fx.dir.path().join("egress"), gate, false).unwrap();

        let a = proxy.socket_path("acme");
        let b = proxy.socket_path("acme2");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 32 + ".sock".len());
        assert!(!name.contains("acme"));
    }
}
