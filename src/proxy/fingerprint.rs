//! Client fingerprinting.
//!
//! A fingerprint is an opaque token that is stable across requests from
//! the same user-agent: the value of the proxy-issued affinity cookie when
//! present, otherwise a hash over remote address and user-agent. It picks
//! backends; it does not authenticate anything.

use axum::http::header::{COOKIE, USER_AGENT};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// Compute the fingerprint for one request.
pub fn fingerprint(headers: &HeaderMap, remote: SocketAddr, cookie_name: &str) -> String {
    if let Some(value) = cookie_value(headers, cookie_name) {
        return value;
    }

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(remote.to_string().as_bytes());
    hasher.update(user_agent.as_bytes());
    hex(&hasher.finalize())
}

/// Extract one cookie's value from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                if let Some(value) = parts.next() {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// First byte of the fingerprint's hash, used by the `ip_hash` strategy.
pub fn hash_byte(fingerprint: &str) -> u8 {
    let digest = Sha256::digest(fingerprint.as_bytes());
    digest[0]
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn remote() -> SocketAddr {
        "192.0.2.10:52311".parse().unwrap()
    }

    #[test]
    fn cookie_wins_over_hash() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; lb_session=abc123; other=1"),
        );
        assert_eq!(fingerprint(&headers, remote(), "lb_session"), "abc123");
    }

    #[test]
    fn hash_is_stable_for_same_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("test-agent/1.0"));
        let a = fingerprint(&headers, remote(), "lb_session");
        let b = fingerprint(&headers, remote(), "lb_session");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "hex sha-256");
    }

    #[test]
    fn hash_differs_for_different_agents() {
        let mut h1 = HeaderMap::new();
        h1.insert(USER_AGENT, HeaderValue::from_static("agent-a"));
        let mut h2 = HeaderMap::new();
        h2.insert(USER_AGENT, HeaderValue::from_static("agent-b"));
        assert_ne!(
            fingerprint(&h1, remote(), "lb_session"),
            fingerprint(&h2, remote(), "lb_session")
        );
    }

    #[test]
    fn missing_cookie_value_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("lb_session="));
        let fp = fingerprint(&headers, remote(), "lb_session");
        assert_eq!(fp.len(), 64);
    }
}
