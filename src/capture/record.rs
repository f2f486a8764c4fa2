//! Captured request/response records
//!
//! A record is created as a [`PendingRequest`] when request headers are
//! parsed and promoted exactly once to an immutable [`CompletedRequest`]
//! when the response has been drained or has failed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Header name (lowercase) to value; repeated headers are joined with `, `
pub type HeaderList = BTreeMap<String, String>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-unique record id
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Flatten a header map for capture
pub fn header_list(headers: &HeaderMap) -> HeaderList {
    let mut list = HeaderList::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        list.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    list
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
            Self::WebSocket => f.write_str("websocket"),
        }
    }
}

/// One captured exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub method: String,
    /// Path plus query string as sent
    pub path: String,
    /// Query string including the leading `?`, or empty
    pub query: String,
    pub protocol: Protocol,
    pub request_headers: HeaderList,
    #[serde(serialize_with = "serialize_body")]
    pub request_body: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
    pub status: Option<u16>,
    pub response_headers: Option<HeaderList>,
    /// Decompressed response body
    #[serde(serialize_with = "serialize_body")]
    pub response_body: Option<Bytes>,
    /// Bytes received from the origin before decompression
    pub response_length: u64,
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_body<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match body {
        Some(bytes) => serializer.serialize_some(&String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

impl RequestRecord {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_some()
    }
}

/// Request-side fields known when headers are parsed
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub host: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub protocol: Protocol,
    pub headers: HeaderList,
}

/// A record whose response has not arrived yet
#[derive(Debug)]
pub struct PendingRequest {
    record: RequestRecord,
    started: Instant,
}

impl PendingRequest {
    /// Open a record with a fresh id
    pub fn new(head: RequestHead) -> Self {
        let query = head
            .path
            .split_once('?')
            .map(|(_, q)| format!("?{}", q))
            .unwrap_or_default();

        Self {
            record: RequestRecord {
                id: next_request_id(),
                host: head.host,
                port: head.port,
                method: head.method,
                path: head.path,
                query,
                protocol: head.protocol,
                request_headers: head.headers,
                request_body: None,
                timestamp: Utc::now(),
                status: None,
                response_headers: None,
                response_body: None,
                response_length: 0,
                response_time_ms: None,
                error: None,
            },
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn record(&self) -> &RequestRecord {
        &self.record
    }

    pub fn set_request_body(&mut self, body: Bytes) {
        self.record.request_body = Some(body);
    }

    /// Promote with the origin's response
    pub fn complete(
        self,
        status: u16,
        headers: HeaderList,
        body: Option<Bytes>,
        wire_length: u64,
    ) -> CompletedRequest {
        let mut record = self.record;
        record.status = Some(status);
        record.response_headers = Some(headers);
        record.response_body = body;
        record.response_length = wire_length;
        record.response_time_ms = Some(elapsed_ms(self.started));
        CompletedRequest(record)
    }

    /// Promote with a proxy-side failure, recorded as status 500
    pub fn fail(self, error: impl Into<String>) -> CompletedRequest {
        let mut record = self.record;
        record.status = Some(500);
        record.error = Some(error.into());
        record.response_time_ms = Some(elapsed_ms(self.started));
        CompletedRequest(record)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Immutable record of a finished exchange
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest(RequestRecord);

impl CompletedRequest {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn record(&self) -> &RequestRecord {
        &self.0
    }

    pub fn into_record(self) -> RequestRecord {
        self.0
    }

    /// Same id, rewritten as a status 500 failure
    ///
    /// Used when an established tunnel breaks after its response went out.
    pub fn into_failed(self, error: impl Into<String>) -> CompletedRequest {
        let mut record = self.0;
        record.status = Some(500);
        record.error = Some(error.into());
        CompletedRequest(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, SET_COOKIE};

    fn head(path: &str) -> RequestHead {
        RequestHead {
            host: "example.com".to_string(),
            port: 80,
            method: "GET".to_string(),
            path: path.to_string(),
            protocol: Protocol::Http,
            headers: HeaderList::new(),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = PendingRequest::new(head("/"));
        let b = PendingRequest::new(head("/"));
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_query_is_split_from_path() {
        let pending = PendingRequest::new(head("/search?q=rust&page=2"));
        assert_eq!(pending.record().path, "/search?q=rust&page=2");
        assert_eq!(pending.record().query, "?q=rust&page=2");

        let pending = PendingRequest::new(head("/plain"));
        assert_eq!(pending.record().query, "");
    }

    #[test]
    fn test_complete_keeps_id_and_sets_response() {
        let mut pending = PendingRequest::new(head("/foo"));
        let id = pending.id();
        pending.set_request_body(Bytes::from_static(b"req"));

        let completed = pending.complete(
            201,
            HeaderList::new(),
            Some(Bytes::from_static(b"resp")),
            42,
        );
        let record = completed.record();
        assert_eq!(record.id, id);
        assert_eq!(record.status, Some(201));
        assert_eq!(record.response_length, 42);
        assert_eq!(record.request_body.as_deref(), Some(&b"req"[..]));
        assert!(record.response_time_ms.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_fail_records_500_and_message() {
        let completed = PendingRequest::new(head("/")).fail("connection refused");
        assert_eq!(completed.record().status, Some(500));
        assert_eq!(completed.record().error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_header_list_joins_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let list = header_list(&headers);
        assert_eq!(list.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
    }

    #[test]
    fn test_serializes_camel_case_with_text_bodies() {
        let mut pending = PendingRequest::new(RequestHead {
            protocol: Protocol::WebSocket,
            ..head("/ws")
        });
        pending.set_request_body(Bytes::from_static(b"ping"));
        let json = serde_json::to_value(pending.record()).unwrap();

        assert_eq!(json["protocol"], "websocket");
        assert_eq!(json["requestBody"], "ping");
        assert_eq!(json["responseLength"], 0);
        assert!(json.get("error").is_none());
    }
}
