// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-pack domain allow/block rules.
//!
//! Rules come from the pack's manifest (`pack.json`, `egress` section).
//! Blocklist wins over allowlist; an empty allowlist means "no domain
//! restriction from the pack manifest" — the network grant still gates.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
struct PackManifestEgress {
    #[serde(default)]
    allowed_domains: Vec<String>,
    #[serde(default)]
    blocked_domains: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PackManifest {
    #[serde(default)]
    egress: PackManifestEgress,
}

/// Compiled domain rules for one pack.
pub struct DomainRules {
    allowed: Option<GlobSet>,
    blocked: GlobSet,
}

impl DomainRules {
    /// Load rules from `<packs_root>/<pack_id>/pack.json`. A missing or
    /// unreadable manifest yields unrestricted rules.
    pub fn load(packs_root: &Path, pack_id: &str) -> Self {
        let manifest_path = packs_root
            .join(rumi_core::sanitize_principal_id(pack_id))
            .join("pack.json");
        let manifest: PackManifest = std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self::from_patterns(
            &manifest.egress.allowed_domains,
            &manifest.egress.blocked_domains,
        )
    }

    /// Compile rules from raw patterns (`*.example.com` style globs).
    pub fn from_patterns(allowed: &[String], blocked: &[String]) -> Self {
        Self {
            allowed: if allowed.is_empty() {
                None
            } else {
                Some(build_globset(allowed))
            },
            blocked: build_globset(blocked),
        }
    }

    /// Whether a domain passes the pack's rules. On deny, the reason is
    /// one of `domain_blocked` / `domain_not_allowed`.
    pub fn check(&self, domain: &str) -> Result<(), &'static str> {
        if self.blocked.is_match(domain) {
            return Err("domain_blocked");
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.is_match(domain) {
                return Err("domain_not_allowed");
            }
        }
        Ok(())
    }
}

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(pattern, error = %e, "skipped invalid domain pattern"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to build domain globset; using empty set");
        GlobSet::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rules_allow_everything() {
        let rules = DomainRules::from_patterns(&[], &[]);
        assert!(rules.check("example.com").is_ok());
        assert!(rules.check("anything.internal").is_ok());
    }

    #[test]
    fn allowlist_restricts_and_supports_globs() {
        let rules =
            DomainRules::from_patterns(&["api.example.com".into(), "*.trusted.io".into()], &[]);
        assert!(rules.check("api.example.com").is_ok());
        assert!(rules.check("svc.trusted.io").is_ok());
        assert_eq!(rules.check("evil.com"), Err("domain_not_allowed"));
    }

    #[test]
    fn blocklist_wins_over_allowlist() {
        let rules = DomainRules::from_patterns(
            &["*.example.com".into()],
            &["bad.example.com".into()],
        );
        assert!(rules.check("good.example.com").is_ok());
        assert_eq!(rules.check("bad.example.com"), Err("domain_blocked"));
    }

    #[test]
    fn rules_load_from_pack_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let pack_dir = dir.path().join("acme");
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(
            pack_dir.join("pack.json"),
            serde_json::to_string(&serde_json::json!({
                "pack_id": "acme",
                "egress": {
                    "allowed_domains": ["api.example.com"],
                    "blocked_domains": [],
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let rules = DomainRules::load(dir.path(), "acme");
        assert!(rules.check("api.example.com").is_ok());
        assert!(rules.check("other.com").is_err());

        // Unknown pack: unrestricted.
        let rules = DomainRules::load(dir.path(), "ghost");
        assert!(rules.check("anything.com").is_ok());
    }
}
