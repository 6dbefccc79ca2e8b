//! Externally reachable URL for a session's dev server.
//!
//! Pure string handling: the same prefix, domain and port always produce the same URL.

use std::net::{IpAddr, Ipv4Addr};

pub const DEFAULT_HOST_PREFIX: &str = "http://localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// e.g. `http://localhost`, `http://10.0.0.5`, `https://preview.example.com`.
    pub prefix: String,
    /// Domain used when `prefix` is a raw IPv4 address: the port becomes a subdomain label.
    pub tunnel_domain: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_HOST_PREFIX.to_string(),
            tunnel_domain: None,
        }
    }
}

struct Parsed<'a> {
    scheme: &'a str,
    host: &'a str,
    path: &'a str,
}

fn parse_prefix(prefix: &str) -> Parsed<'_> {
    let (scheme, rest) = match prefix.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("http", prefix),
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };

    let host = if authority.starts_with('[') {
        // [v6]:port
        match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        }
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() => h,
            _ => authority,
        }
    };

    Parsed { scheme, host, path }
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

fn normalize_domain(domain: &str) -> Option<&str> {
    let d = domain.trim();
    let d = d
        .strip_prefix("https://")
        .or_else(|| d.strip_prefix("http://"))
        .unwrap_or(d);
    let d = d.trim_matches(|c| c == '.' || c == '/');
    if d.is_empty() { None } else { Some(d) }
}

pub fn resolve(cfg: &HostConfig, port: u16) -> String {
    let raw = cfg.prefix.trim();
    let prefix = if raw.is_empty() {
        DEFAULT_HOST_PREFIX
    } else {
        raw
    };

    let trimmed = prefix.trim_end_matches('/');
    let p = parse_prefix(trimmed);

    if is_local_host(p.host) {
        return format!("{}://{}:{}{}", p.scheme, p.host, port, p.path);
    }

    if p.host.parse::<Ipv4Addr>().is_ok() {
        return match cfg.tunnel_domain.as_deref().and_then(normalize_domain) {
            Some(domain) => format!("https://{port}.{domain}"),
            // Without a templating domain the raw address is the best we can offer.
            None => format!("{}://{}:{}{}", p.scheme, p.host, port, p.path),
        };
    }

    // Already routable (reverse proxy / tunnel in front).
    prefix.to_string()
}
