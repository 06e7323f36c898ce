// SPDX-License-Identifier: MIT OR Apache-2.0
//! Internal-IP policy and DNS resolution checks.
//!
//! The internal ranges are checked before any grant evaluation so a
//! misconfigured rule can never permit loopback, RFC1918, link-local,
//! CGNAT, or multicast targets.

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Ranges an egress request may never target.
pub fn default_blocked_networks() -> Vec<IpNet> {
    [
        "0.0.0.0/8",
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "100.64.0.0/10",
        "224.0.0.0/4",
        "::1/128",
        "::/128",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .map(|net| net.parse().expect("static network parses"))
    .collect()
}

/// Whether `ip` falls inside any blocked range.
pub fn is_internal_ip(ip: IpAddr, blocked: &[IpNet]) -> bool {
    blocked.iter().any(|net| net.contains(&ip))
}

/// Whether the host portion of a URL is an IP literal.
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    // Bracketed IPv6 literals arrive without the brackets from the URL
    // parser, but accept both forms.
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed.parse().ok()
}

/// Resolve `host:port` and reject when any resolved address is internal.
///
/// Returns the full address list so the connection can be pinned to an
/// address that was actually checked (rebind defense).
pub async fn resolve_and_check(
    host: &str,
    port: u16,
    blocked: &[IpNet],
) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("dns_resolution_failed: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err("dns_resolution_failed: no addresses".into());
    }
    for addr in &addrs {
        if is_internal_ip(addr.ip(), blocked) {
            return Err("dns_resolves_internal".into());
        }
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_private_and_cgnat_are_internal() {
        let blocked = default_blocked_networks();
        for ip in [
            "127.0.0.1",
            "127.255.0.9",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.0.10",
            "100.64.0.1",
            "224.0.0.5",
            "::1",
            "fe80::1",
            "fd00::2",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(is_internal_ip(ip, &blocked), "{ip} should be internal");
        }
    }

    #[test]
    fn public_addresses_are_not_internal() {
        let blocked = default_blocked_networks();
        for ip in ["93.184.216.34", "1.1.1.1", "172.32.0.1", "2606:4700::1111"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(!is_internal_ip(ip, &blocked), "{ip} should be external");
        }
    }

    #[test]
    fn ip_literal_detection() {
        assert!(parse_ip_literal("127.0.0.1").is_some());
        assert!(parse_ip_literal("[::1]").is_some());
        assert!(parse_ip_literal("example.com").is_none());
    }

    #[tokio::test]
    async fn localhost_resolution_is_rejected() {
        let blocked = default_blocked_networks();
        let err = resolve_and_check("localhost", 443, &blocked).await.unwrap_err();
        assert_eq!(err, "dns_resolves_internal");
    }
}
