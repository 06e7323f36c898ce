// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-core
//!
//! Shared foundations for the Rumi execution kernel: the stable error
//! taxonomy, principal hierarchy, canonical JSON hashing, HMAC signing,
//! path containment helpers, and kernel configuration.

#![deny(unsafe_code)]

pub mod canonical;
pub mod config;
pub mod error;
pub mod paths;
pub mod principal;
pub mod ratelimit;
pub mod signing;

pub use canonical::{canonical_json, value_hash};
pub use config::KernelConfig;
pub use error::{ErrorKind, KernelError};
pub use principal::{intersect_config, parse_principal_chain, sanitize_principal_id};

/// Current UTC timestamp as ISO-8601 with a trailing `Z`.
///
/// Every persisted record in the kernel (audit entries, grants, store rows,
/// secrets) carries timestamps in this form.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::now_ts;

    #[test]
    fn timestamps_are_utc_with_z_suffix() {
        let ts = now_ts();
        assert!(ts.ends_with('Z'), "expected Z suffix: {ts}");
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[7..8], "-");
    }
}
