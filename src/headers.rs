//! Header rewriting for forwarded messages

use http::header::{CONNECTION, CONTENT_ENCODING, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tracing::warn;

/// Check if header is hop-by-hop (RFC 7230 § 6.1)
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

/// Remove hop-by-hop headers, including any named in `Connection`
///
/// With `keep_upgrade` the `Connection`/`Upgrade` pair survives so a
/// protocol upgrade can be relayed.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .filter(|name| !(keep_upgrade && *name == UPGRADE))
        .collect();
    for name in listed {
        headers.remove(&name);
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .filter(|name| !(keep_upgrade && (**name == CONNECTION || **name == UPGRADE)))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(&name);
    }
}

/// Validate configured custom headers
pub fn parse_custom_headers(
    custom: &BTreeMap<String, String>,
) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    custom
        .iter()
        .map(|(name, value)| {
            let header_name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| format!("invalid header name '{}'", name))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header '{}'", name))?;
            Ok((header_name, header_value))
        })
        .collect()
}

/// Apply custom headers, replacing any same-named incoming header
pub fn apply_custom_headers(headers: &mut HeaderMap, custom: &BTreeMap<String, String>) {
    for (name, value) in custom {
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid custom header"),
        }
    }
}

/// Set `Host` when the client did not send one
pub fn ensure_host(headers: &mut HeaderMap, authority: &str) {
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(authority) {
            headers.insert(HOST, value);
        }
    }
}

/// Whether a request asks for a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
        .unwrap_or(false)
}

pub fn content_encoding(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = map(&[
            ("connection", "keep-alive, x-trace"),
            ("keep-alive", "timeout=5"),
            ("proxy-connection", "keep-alive"),
            ("x-trace", "1"),
            ("accept", "*/*"),
        ]);
        strip_hop_by_hop(&mut headers, false);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_keep_upgrade_pair() {
        let mut headers = map(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("proxy-connection", "keep-alive"),
        ]);
        strip_hop_by_hop(&mut headers, true);

        assert!(headers.contains_key(CONNECTION));
        assert!(headers.contains_key(UPGRADE));
        assert!(!headers.contains_key("proxy-connection"));
    }

    #[test]
    fn test_custom_headers_override_incoming() {
        let mut headers = map(&[("user-agent", "curl/8.0"), ("accept", "*/*")]);
        let custom = BTreeMap::from([
            ("User-Agent".to_string(), "kproxy".to_string()),
            ("X-Test".to_string(), "1".to_string()),
        ]);
        apply_custom_headers(&mut headers, &custom);

        assert_eq!(headers.get_all("user-agent").iter().count(), 1);
        assert_eq!(headers["user-agent"], "kproxy");
        assert_eq!(headers["x-test"], "1");
        assert_eq!(headers["accept"], "*/*");
    }

    #[test]
    fn test_parse_custom_headers_rejects_invalid() {
        let bad_name = BTreeMap::from([("bad name".to_string(), "v".to_string())]);
        assert!(parse_custom_headers(&bad_name).is_err());

        let bad_value = BTreeMap::from([("x-ok".to_string(), "line\nbreak".to_string())]);
        assert!(parse_custom_headers(&bad_value).is_err());

        let good = BTreeMap::from([("x-ok".to_string(), "fine".to_string())]);
        assert_eq!(parse_custom_headers(&good).unwrap().len(), 1);
    }

    #[test]
    fn test_websocket_detection() {
        assert!(is_websocket_upgrade(&map(&[("upgrade", "WebSocket")])));
        assert!(!is_websocket_upgrade(&map(&[("upgrade", "h2c")])));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn test_ensure_host_and_content_encoding() {
        let mut headers = HeaderMap::new();
        ensure_host(&mut headers, "example.com:8080");
        assert_eq!(headers[HOST], "example.com:8080");

        ensure_host(&mut headers, "other.com");
        assert_eq!(headers[HOST], "example.com:8080");

        assert_eq!(content_encoding(&map(&[("content-encoding", "GZIP")])), Some("GZIP".to_string()));
        assert_eq!(content_encoding(&HeaderMap::new()), None);
    }
}
