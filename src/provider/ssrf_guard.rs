//! Loopback/SSRF guard for localhost-only adapters, grounded in
//! `cloudllm::mcp_server_builder_utils::IpFilter`'s IP/CIDR allowlisting logic, adapted
//! here to a single "is this URL loopback-safe" check per SPEC_FULL §4.8.

use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

/// Validates that `raw_url` is well-formed HTTP(S), resolves (or is literally) a
/// loopback address, and does not target a privileged port. Intended for adapters that
/// speak to an on-device server (e.g. a local model runner).
pub fn validate_loopback_url(raw_url: &str, privileged_port_ceiling: u16) -> Result<Url, String> {
    let url = Url::parse(raw_url).map_err(|e| format!("malformed URL: {e}"))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}', expected http or https")),
    }

    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;

    if let Some(port) = url.port() {
        if port < privileged_port_ceiling {
            return Err(format!("privileged port {port} is not permitted"));
        }
    }

    let is_loopback = if let Ok(ip) = host.parse::<IpAddr>() {
        is_loopback_ip(ip)
    } else if host.eq_ignore_ascii_case("localhost") {
        true
    } else {
        // Resolve the hostname and require every resolved address to be loopback;
        // fail closed if resolution itself fails.
        let lookup = format!("{host}:{}", url.port().unwrap_or(80));
        match lookup.to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<_> = addrs.collect();
                !addrs.is_empty() && addrs.iter().all(|a| is_loopback_ip(a.ip()))
            }
            Err(_) => false,
        }
    };

    if !is_loopback {
        return Err(format!("host '{host}' is not a loopback address"));
    }

    Ok(url)
}

fn is_loopback_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST || v4.octets()[0] == 127,
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_localhost() {
        assert!(validate_loopback_url("http://localhost:11434/v1/models", 1024).is_ok());
    }

    #[test]
    fn accepts_loopback_ip() {
        assert!(validate_loopback_url("http://127.0.0.1:8080", 1024).is_ok());
    }

    #[test]
    fn rejects_remote_host() {
        assert!(validate_loopback_url("http://example.com", 1024).is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(validate_loopback_url("ftp://127.0.0.1", 1024).is_err());
    }

    #[test]
    fn rejects_privileged_port() {
        assert!(validate_loopback_url("http://127.0.0.1:22", 1024).is_err());
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(validate_loopback_url("not a url", 1024).is_err());
    }
}
