//! HTTP helpers for host comparison and header parsing.

use axum::http::{HeaderMap, header};
use std::time::Duration;

use crate::error::DavError;

/// Splits an authority string into host and optional port, tolerating
/// bracketed IPv6 literals.
fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        return (host, tail.strip_prefix(':').and_then(|p| p.parse().ok()));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some(s) if s.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    }
}

/// Compares an authority from a client-supplied URI against the request's
/// `Host` header. Hosts compare case-insensitively; a port implied by the
/// scheme matches an authority that leaves it implicit.
pub fn same_host(authority: &str, scheme: Option<&str>, request_host: &str) -> bool {
    let (host, port) = split_host_port(authority);
    let (req_host, req_port) = split_host_port(request_host);
    host.eq_ignore_ascii_case(req_host)
        && port.unwrap_or_else(|| default_port(scheme)) == req_port.unwrap_or(80)
}

/// Desired depth of the request; `infinity` and absence map to -1.
pub fn parse_depth(headers: &HeaderMap) -> Result<i32, DavError> {
    let value = headers
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if value.is_empty() || value.eq_ignore_ascii_case("infinity") {
        return Ok(-1);
    }
    let depth: i32 = value.parse().map_err(|e| DavError::BAD_DEPTH.with_cause(e))?;
    if depth < 0 {
        return Err(DavError::BAD_DEPTH.with_cause("depth must be non-negative or infinity"));
    }
    Ok(depth)
}

/// Desired lock timeout. Only the first three presented options are
/// considered; RFC 4918 permits ignoring this header entirely, so invalid
/// options are skipped and the default is one second.
pub fn parse_timeout(headers: &HeaderMap) -> Duration {
    let value = headers
        .get("timeout")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    for option in value.splitn(3, ',') {
        let option = option.trim();
        if option == "Infinite" {
            continue;
        }
        let option = option.strip_prefix("Second-").unwrap_or(option);
        if let Ok(secs) = option.parse::<u64>() {
            return Duration::from_secs(secs);
        }
    }
    Duration::from_secs(1)
}

/// The `Overwrite` header defaults to true; only a literal `F` disables it.
pub fn parse_overwrite(headers: &HeaderMap) -> bool {
    headers
        .get("overwrite")
        .and_then(|v| v.to_str().ok())
        .map(|v| v != "F")
        .unwrap_or(true)
}

/// Request `Host` header, used to validate `Destination` and tagged `If`
/// resources.
pub fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn host_comparison_is_port_aware() {
        assert!(same_host("example.com", Some("http"), "example.com"));
        assert!(same_host("Example.COM:80", Some("http"), "example.com"));
        assert!(same_host("example.com", Some("http"), "example.com:80"));
        assert!(!same_host("example.com:8080", Some("http"), "example.com"));
        assert!(!same_host("other.com", Some("http"), "example.com"));
        assert!(!same_host("example.com", Some("https"), "example.com"));
    }

    #[test]
    fn depth_parsing() {
        assert_eq!(parse_depth(&headers(&[])).unwrap(), -1);
        assert_eq!(parse_depth(&headers(&[("depth", "infinity")])).unwrap(), -1);
        assert_eq!(parse_depth(&headers(&[("depth", "Infinity")])).unwrap(), -1);
        assert_eq!(parse_depth(&headers(&[("depth", "0")])).unwrap(), 0);
        assert_eq!(parse_depth(&headers(&[("depth", "2")])).unwrap(), 2);
        assert!(parse_depth(&headers(&[("depth", "-2")])).is_err());
        assert!(parse_depth(&headers(&[("depth", "deep")])).is_err());
    }

    #[test]
    fn timeout_parsing() {
        assert_eq!(parse_timeout(&headers(&[])), Duration::from_secs(1));
        assert_eq!(
            parse_timeout(&headers(&[("timeout", "Second-90")])),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_timeout(&headers(&[("timeout", "Infinite, Second-45")])),
            Duration::from_secs(45)
        );
        assert_eq!(
            parse_timeout(&headers(&[("timeout", "bogus")])),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn overwrite_parsing() {
        assert!(parse_overwrite(&headers(&[])));
        assert!(parse_overwrite(&headers(&[("overwrite", "T")])));
        assert!(!parse_overwrite(&headers(&[("overwrite", "F")])));
    }
}
