// SPDX-License-Identifier: MIT OR Apache-2.0
//! The egress request gate.
//!
//! Validation order is load-bearing: internal-IP and DNS-rebind checks run
//! BEFORE domain rules and grant evaluation so no rule can ever permit an
//! internal target. The outbound connection is pinned to an address that
//! passed the check, and every redirect hop re-runs the full gate.

use crate::domain::DomainRules;
use crate::ip;
use crate::protocol::{validate_request, EgressRequest, EgressResponse};
use ipnet::IpNet;
use reqwest::redirect::Policy;
use rumi_audit::AuditLogger;
use rumi_core::ratelimit::SlidingWindowLimiter;
use rumi_core::{ErrorKind, KernelError};
use rumi_grant::GrantManager;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default per-hop timeout.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
/// Upper bound a pack may request, per hop.
pub const MAX_TIMEOUT_SECONDS: f64 = 120.0;
/// Redirect budget per request.
pub const MAX_REDIRECT_HOPS: u32 = 3;

/// Tunable gate policy. [`GateConfig::default`] is the production posture.
pub struct GateConfig {
    pub blocked_networks: Vec<IpNet>,
    pub max_redirects: u32,
    pub max_response_bytes: u64,
    pub rate_limit_per_min: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            blocked_networks: ip::default_blocked_networks(),
            max_redirects: MAX_REDIRECT_HOPS,
            max_response_bytes: 4 * 1024 * 1024,
            rate_limit_per_min: 60,
        }
    }
}

/// Per-pack egress request gate.
pub struct EgressGate {
    config: GateConfig,
    grants: Arc<GrantManager>,
    audit: Arc<AuditLogger>,
    limiter: SlidingWindowLimiter,
    packs_root: PathBuf,
}

impl EgressGate {
    pub fn new(
        config: GateConfig,
        grants: Arc<GrantManager>,
        audit: Arc<AuditLogger>,
        packs_root: impl Into<PathBuf>,
    ) -> Self {
        let limiter = SlidingWindowLimiter::new(config.rate_limit_per_min, Duration::from_secs(60));
        Self {
            config,
            grants,
            audit,
            limiter,
            packs_root: packs_root.into(),
        }
    }

    /// Gate and execute one request on behalf of `pack_id`. The pack's
    /// identity comes from which socket it connected to, never from the
    /// payload.
    pub async fn handle(&self, pack_id: &str, request: EgressRequest) -> EgressResponse {
        let started = Instant::now();

        let url = match reqwest::Url::parse(&request.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                return self.deny(
                    pack_id,
                    &request.url,
                    0,
                    ErrorKind::InvalidRequest,
                    "invalid_url",
                    started,
                );
            }
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        if let Err(e) = validate_request(&request) {
            return self.deny(pack_id, &host, port, e.kind, &e.message, started);
        }

        let rules = DomainRules::load(&self.packs_root, pack_id);

        // First-hop gate: internal-IP / DNS / domain rules, then rate
        // limit, then grant.
        let addrs = match self.gate_target(pack_id, &url, &rules).await {
            Ok(addrs) => addrs,
            Err((kind, reason)) => {
                return self.deny(pack_id, &host, port, kind, &reason, started);
            }
        };

        if !self.limiter.check(pack_id) {
            return self.deny(
                pack_id,
                &host,
                port,
                ErrorKind::RateLimited,
                &format!("rate_limit_exceeded ({}/min)", self.limiter.max_requests()),
                started,
            );
        }

        if let Err(reason) = self.check_grant(pack_id, &url) {
            return self.deny(pack_id, &host, port, ErrorKind::GrantDenied, &reason, started);
        }

        // Execute with a manual redirect loop; every hop re-gates.
        let timeout = Duration::from_secs_f64(
            request
                .timeout_seconds
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
                .clamp(0.1, MAX_TIMEOUT_SECONDS),
        );
        match self
            .execute(pack_id, &request, url.clone(), addrs, &rules, timeout, started)
            .await
        {
            Ok(response) => {
                let mut details = Map::new();
                details.insert("method".into(), json!(request.method.to_uppercase()));
                details.insert("url".into(), json!(request.url));
                details.insert("status_code".into(), json!(response.status_code));
                details.insert("bytes_read".into(), json!(response.bytes_read));
                details.insert("redirect_hops".into(), json!(response.redirect_hops));
                self.audit
                    .log_network_event(pack_id, &host, port, true, None, details);
                response
            }
            Err((kind, reason)) => self.deny(pack_id, &host, port, kind, &reason, started),
        }
    }

    /// Internal-IP, DNS-rebind, and domain checks for one target URL.
    /// Returns addresses safe to pin the connection to.
    async fn gate_target(
        &self,
        _pack_id: &str,
        url: &reqwest::Url,
        rules: &DomainRules,
    ) -> Result<Vec<SocketAddr>, (ErrorKind, String)> {
        let Some(host) = url.host_str() else {
            return Err((ErrorKind::InvalidRequest, "invalid_url".into()));
        };
        let port = url.port_or_known_default().unwrap_or(443);

        // 1. IP literals never reach DNS.
        if let Some(ip) = ip::parse_ip_literal(host) {
            if ip::is_internal_ip(ip, &self.config.blocked_networks) {
                return Err((ErrorKind::SecurityViolation, "internal_ip_blocked".into()));
            }
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        // 2. Resolve and reject internal results (rebind defense).
        let addrs = ip::resolve_and_check(host, port, &self.config.blocked_networks)
            .await
            .map_err(|reason| {
                if reason == "dns_resolves_internal" {
                    (ErrorKind::SecurityViolation, reason)
                } else {
                    (ErrorKind::InvalidRequest, reason)
                }
            })?;

        // 3. Pack-level domain rules.
        rules
            .check(host)
            .map_err(|reason| (ErrorKind::GrantDenied, reason.to_string()))?;

        Ok(addrs)
    }

    /// Network grant: `<host>:<port>` exact, falling back to a host-wide
    /// grant whose config may restrict ports.
    fn check_grant(&self, pack_id: &str, url: &reqwest::Url) -> Result<(), String> {
        let host = url.host_str().unwrap_or_default();
        let port = url.port_or_known_default().unwrap_or(443);

        let exact = self.grants.check(pack_id, &format!("{host}:{port}"));
        if exact.allowed {
            return Ok(());
        }
        let host_wide = self.grants.check(pack_id, host);
        if host_wide.allowed {
            let ports_ok = match host_wide.config.get("ports") {
                None => true,
                Some(Value::Array(ports)) => {
                    ports.iter().any(|p| p.as_u64() == Some(port as u64))
                }
                Some(_) => false,
            };
            if ports_ok {
                return Ok(());
            }
            return Err(format!("port {port} not granted for {host}"));
        }
        Err(exact.reason)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        pack_id: &str,
        request: &EgressRequest,
        mut url: reqwest::Url,
        mut addrs: Vec<SocketAddr>,
        rules: &DomainRules,
        timeout: Duration,
        started: Instant,
    ) -> Result<EgressResponse, (ErrorKind, String)> {
        let method: reqwest::Method = request
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| (ErrorKind::InvalidRequest, "invalid_method".into()))?;

        let mut hops: u32 = 0;
        loop {
            let host = url.host_str().unwrap_or_default().to_string();
            let mut builder = reqwest::Client::builder()
                .redirect(Policy::none())
                .timeout(timeout);
            // Pin the connection to an address that passed the gate.
            if ip::parse_ip_literal(&host).is_none() {
                if let Some(addr) = addrs.first() {
                    builder = builder.resolve(&host, *addr);
                }
            }
            let client = builder
                .build()
                .map_err(|e| (ErrorKind::InternalError, format!("client build: {e}")))?;

            let mut req = client.request(method.clone(), url.clone());
            for (name, value) in &request.headers {
                if let Some(text) = value.as_str() {
                    req = req.header(name.as_str(), text);
                }
            }
            if let Some(body) = &request.body {
                req = req.body(body.clone());
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    (ErrorKind::Timeout, format!("timed out after {:.1}s", timeout.as_secs_f64()))
                } else {
                    (ErrorKind::InternalError, format!("request_failed: {e}"))
                }
            })?;

            let status = response.status();
            if status.is_redirection() {
                hops += 1;
                if hops > self.config.max_redirects {
                    return Err((
                        ErrorKind::InvalidRequest,
                        format!("redirect_limit_exceeded (max {})", self.config.max_redirects),
                    ));
                }
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err((ErrorKind::InvalidRequest, "redirect_without_location".into()));
                };
                url = url
                    .join(location)
                    .map_err(|_| (ErrorKind::InvalidRequest, "invalid_redirect_location".into()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err((ErrorKind::InvalidRequest, "invalid_redirect_scheme".into()));
                }

                // Re-gate the new target: internal IP, DNS, domain rules,
                // and the grant all get another say.
                addrs = self.gate_target(pack_id, &url, rules).await?;
                self.check_grant(pack_id, &url)
                    .map_err(|reason| (ErrorKind::GrantDenied, reason))?;
                continue;
            }

            // Terminal response: stream the body under the read cap.
            let status_code = status.as_u16();
            let mut headers = Map::new();
            for (name, value) in response.headers() {
                headers.insert(
                    name.as_str().to_string(),
                    json!(String::from_utf8_lossy(value.as_bytes())),
                );
            }
            let final_url = response.url().to_string();

            let mut body = Vec::new();
            let mut stream = response;
            loop {
                match stream.chunk().await {
                    Ok(Some(chunk)) => {
                        if body.len() as u64 + chunk.len() as u64 > self.config.max_response_bytes {
                            // Exceeding the cap fails the request; a
                            // partial body is never returned.
                            return Err((
                                ErrorKind::ResponseTooLarge,
                                format!(
                                    "response exceeds {} bytes",
                                    self.config.max_response_bytes
                                ),
                            ));
                        }
                        body.extend_from_slice(&chunk);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        return Err((ErrorKind::InternalError, format!("body read: {e}")));
                    }
                }
            }

            return Ok(EgressResponse {
                success: true,
                status_code: Some(status_code),
                headers: Some(headers),
                body: Some(String::from_utf8_lossy(&body).into_owned()),
                error: None,
                error_type: None,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                redirect_hops: hops,
                bytes_read: body.len() as u64,
                final_url: Some(final_url),
            });
        }
    }

    fn deny(
        &self,
        pack_id: &str,
        host: &str,
        port: u16,
        kind: ErrorKind,
        reason: &str,
        started: Instant,
    ) -> EgressResponse {
        let mut details = Map::new();
        details.insert("reason".into(), json!(reason));
        details.insert("error_type".into(), json!(kind.as_str()));
        self.audit.log_network_event(
            pack_id,
            host,
            port,
            false,
            Some(reason.to_string()),
            details,
        );
        EgressResponse::denied(kind, started.elapsed().as_secs_f64() * 1000.0)
    }
}

impl std::fmt::Debug for EgressGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressGate")
            .field("packs_root", &self.packs_root)
            .finish_non_exhaustive()
    }
}

// Re-exported for the proxy's connection handler.
pub(crate) fn internal_error_response(e: &KernelError, started: Instant) -> EgressResponse {
    EgressResponse {
        success: false,
        status_code: None,
        headers: None,
        body: None,
        error: Some(e.public_message().to_string()),
        error_type: Some(e.kind.as_str().to_string()),
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        redirect_hops: 0,
        bytes_read: 0,
        final_url: None,
    }
}
