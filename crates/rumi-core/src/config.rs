// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kernel configuration, read once from `RUMI_*` environment variables.
//!
//! Components take the values they need from a [`KernelConfig`] handed down
//! by the daemon; tests construct one directly instead of mutating the
//! process environment.

use std::path::PathBuf;

/// Security posture for plaintext-secret fallback and host-mode execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Plaintext fallback disabled regardless of the auto policy.
    Strict,
    /// Marker-based plaintext fallback decisions.
    Permissive,
}

/// Policy for reading secrets that are still stored as plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextPolicy {
    /// Allowed until every secret is encrypted, then permanently disabled.
    Auto,
    /// Always allowed (migration window only).
    Always,
    /// Never allowed.
    Never,
}

/// Kernel-wide configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Root of all persisted kernel state.
    pub user_data_dir: PathBuf,
    /// `RUMI_SECURITY_MODE` — default strict.
    pub security_mode: SecurityMode,
    /// `RUMI_SECRETS_ALLOW_PLAINTEXT` — default auto.
    pub secrets_allow_plaintext: PlaintextPolicy,
    /// `RUMI_SECRETS_KEY` — overrides the on-disk encryption key.
    pub secrets_key: Option<String>,
    /// `RUMI_HMAC_SECRET` — overrides the on-disk signing key.
    pub hmac_secret: Option<String>,
    /// `RUMI_REQUIRE_HMAC` — reject legacy unsigned sharing files.
    pub require_hmac: bool,
    /// `RUMI_MAX_CONCURRENT_FLOWS` — flow-run semaphore width.
    pub max_concurrent_flows: usize,
    /// `RUMI_MAX_RESPONSE_BYTES` — flow result truncation threshold.
    pub max_response_bytes: usize,
    /// `RUMI_SECRET_GET_RATE_LIMIT` — secrets.get requests/minute/principal.
    pub secret_get_rate_limit: u32,
    /// `RUMI_TRUST_AUTO_RELOAD` — mtime-based trust-store hot reload.
    pub trust_auto_reload: bool,
    /// `RUMI_API_TOKEN` — control-plane bearer token.
    pub api_token: Option<String>,
    /// `RUMI_EGRESS_RATE_LIMIT` — egress requests/minute/pack.
    pub egress_rate_limit: u32,
    /// `RUMI_EGRESS_SOCKET_WORLD_RW` — relax UDS mode 0660 → 0666.
    pub egress_socket_world_rw: bool,
    /// `RUMI_IMPORT_MAX_FILES` — per-import file count cap.
    pub import_max_files: usize,
    /// `RUMI_IMPORT_MAX_UNCOMPRESSED_BYTES` — per-import total size cap.
    pub import_max_uncompressed_bytes: u64,
    /// `RUMI_IMPORT_MAX_SINGLE_FILE_BYTES` — per-file size cap.
    pub import_max_single_file_bytes: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_data_dir: PathBuf::from("user_data"),
            security_mode: SecurityMode::Strict,
            secrets_allow_plaintext: PlaintextPolicy::Auto,
            secrets_key: None,
            hmac_secret: None,
            require_hmac: false,
            max_concurrent_flows: 10,
            max_response_bytes: 4 * 1024 * 1024,
            secret_get_rate_limit: 60,
            trust_auto_reload: false,
            api_token: None,
            egress_rate_limit: 60,
            egress_socket_world_rw: false,
            import_max_files: 2000,
            import_max_uncompressed_bytes: 500 * 1024 * 1024,
            import_max_single_file_bytes: 200 * 1024 * 1024,
        }
    }
}

impl KernelConfig {
    /// Build a config from the process environment, falling back to
    /// defaults for unset or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_data_dir: env_string("RUMI_USER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.user_data_dir),
            security_mode: match env_string("RUMI_SECURITY_MODE").as_deref() {
                Some("permissive") => SecurityMode::Permissive,
                _ => SecurityMode::Strict,
            },
            secrets_allow_plaintext: match env_string("RUMI_SECRETS_ALLOW_PLAINTEXT").as_deref() {
                Some("true") => PlaintextPolicy::Always,
                Some("false") => PlaintextPolicy::Never,
                _ => PlaintextPolicy::Auto,
            },
            secrets_key: env_string("RUMI_SECRETS_KEY"),
            hmac_secret: env_string("RUMI_HMAC_SECRET"),
            require_hmac: env_string("RUMI_REQUIRE_HMAC").as_deref() == Some("1"),
            max_concurrent_flows: env_parse("RUMI_MAX_CONCURRENT_FLOWS", defaults.max_concurrent_flows),
            max_response_bytes: env_parse("RUMI_MAX_RESPONSE_BYTES", defaults.max_response_bytes),
            secret_get_rate_limit: env_parse("RUMI_SECRET_GET_RATE_LIMIT", defaults.secret_get_rate_limit),
            trust_auto_reload: env_string("RUMI_TRUST_AUTO_RELOAD").as_deref() == Some("1"),
            api_token: env_string("RUMI_API_TOKEN"),
            egress_rate_limit: env_parse("RUMI_EGRESS_RATE_LIMIT", defaults.egress_rate_limit),
            egress_socket_world_rw: env_string("RUMI_EGRESS_SOCKET_WORLD_RW").as_deref() == Some("1"),
            import_max_files: env_parse("RUMI_IMPORT_MAX_FILES", defaults.import_max_files),
            import_max_uncompressed_bytes: env_parse(
                "RUMI_IMPORT_MAX_UNCOMPRESSED_BYTES",
                defaults.import_max_uncompressed_bytes,
            ),
            import_max_single_file_bytes: env_parse(
                "RUMI_IMPORT_MAX_SINGLE_FILE_BYTES",
                defaults.import_max_single_file_bytes,
            ),
        }
    }

    /// Root a default config at `dir` (test helper used across crates).
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        Self {
            user_data_dir: dir.into(),
            ..Self::default()
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => raw.parse().unwrap_or(default),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.security_mode, SecurityMode::Strict);
        assert_eq!(cfg.secrets_allow_plaintext, PlaintextPolicy::Auto);
        assert_eq!(cfg.max_concurrent_flows, 10);
        assert_eq!(cfg.max_response_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.secret_get_rate_limit, 60);
        assert_eq!(cfg.egress_rate_limit, 60);
        assert!(!cfg.require_hmac);
        assert!(!cfg.trust_auto_reload);
    }

    #[test]
    fn rooted_at_overrides_only_the_data_dir() {
        let cfg = KernelConfig::rooted_at("/tmp/kernel-test");
        assert_eq!(cfg.user_data_dir, PathBuf::from("/tmp/kernel-test"));
        assert_eq!(cfg.max_concurrent_flows, 10);
    }
}
