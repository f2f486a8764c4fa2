//! Per-exchange recording
//!
//! Each proxied exchange gets one recorder task that owns its
//! [`PendingRequest`]. The task publishes `request` once the request body has
//! been read and only then waits for the response, so `request(id)` always
//! precedes `response(id)`.

use super::record::{CompletedRequest, HeaderList, PendingRequest};
use super::Recorder;
use crate::error::ProxyError;
use crate::body::{CaptureHandle, CaptureOutcome};
use crate::decompress::decode_body;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What the forwarding path learned from the origin
pub(crate) enum UpstreamOutcome {
    Received {
        status: u16,
        headers: HeaderList,
        content_encoding: Option<String>,
        body: CaptureHandle,
    },
    Failed(ProxyError),
}

/// Recorder for one HTTP exchange
pub(crate) struct Exchange {
    pending: PendingRequest,
    in_scope: bool,
    recorder: Recorder,
    body_limit: usize,
}

impl Exchange {
    pub(crate) fn new(
        pending: PendingRequest,
        in_scope: bool,
        recorder: Recorder,
        body_limit: usize,
    ) -> Self {
        Self {
            pending,
            in_scope,
            recorder,
            body_limit,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.pending.id()
    }

    /// Run the recorder in the background
    pub(crate) fn spawn(
        self,
        request_body: CaptureHandle,
        upstream: oneshot::Receiver<UpstreamOutcome>,
    ) {
        tokio::spawn(self.run(request_body, upstream));
    }

    async fn run(self, request_body: CaptureHandle, upstream: oneshot::Receiver<UpstreamOutcome>) {
        let Exchange {
            mut pending,
            in_scope,
            recorder,
            body_limit,
        } = self;
        let id = pending.id();

        let captured = match request_body.outcome().await {
            CaptureOutcome::Complete(captured) | CaptureOutcome::Aborted(captured) => captured,
            CaptureOutcome::Failed { captured, error } => {
                debug!(id, error = %error, "Request body stream failed");
                captured
            }
        };
        pending.set_request_body(captured.bytes);

        if in_scope {
            recorder.request(pending.record()).await;
        }

        let completed = match upstream.await {
            Err(_) => {
                debug!(id, "Exchange dropped before the origin answered");
                return;
            }
            Ok(UpstreamOutcome::Failed(error)) => pending.fail(error.to_string()),
            Ok(UpstreamOutcome::Received {
                status,
                headers,
                content_encoding,
                body,
            }) => match body.outcome().await {
                CaptureOutcome::Complete(captured) => {
                    let decoded =
                        decode_body(&captured.bytes, content_encoding.as_deref(), body_limit);
                    pending.complete(status, headers, Some(decoded), captured.wire_length)
                }
                CaptureOutcome::Failed { error, .. } => {
                    warn!(id, error = %error, "Origin response stream failed");
                    pending.fail(error)
                }
                CaptureOutcome::Aborted(_) => {
                    debug!(id, "Client went away before the response completed");
                    return;
                }
            },
        };

        debug!(
            id,
            status = ?completed.record().status,
            response_length = completed.record().response_length,
            "Exchange complete"
        );

        if in_scope {
            recorder.response(completed).await;
        }
    }
}

/// Recorder for a CONNECT tunnel or WebSocket splice
///
/// The request is published on open and the response as soon as the tunnel
/// is established. A tunnel that breaks later gets one failure update.
pub(crate) struct TunnelCapture {
    pending: PendingRequest,
    in_scope: bool,
    recorder: Recorder,
}

impl TunnelCapture {
    pub(crate) async fn open(pending: PendingRequest, in_scope: bool, recorder: Recorder) -> Self {
        if in_scope {
            recorder.request(pending.record()).await;
        }
        Self {
            pending,
            in_scope,
            recorder,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.pending.id()
    }

    /// Publish the response for a tunnel that is now carrying bytes
    pub(crate) async fn establish(self, status: u16, headers: HeaderList) -> EstablishedTunnel {
        let completed = self.pending.complete(status, headers, None, 0);
        if self.in_scope {
            self.recorder.response(completed.clone()).await;
        }
        EstablishedTunnel {
            completed,
            in_scope: self.in_scope,
            recorder: self.recorder,
        }
    }

    /// Publish a failure before the tunnel was established
    pub(crate) async fn fail(self, error: &ProxyError) {
        let completed = self.pending.fail(error.to_string());
        if self.in_scope {
            self.recorder.response(completed).await;
        }
    }
}

/// A tunnel whose response has been published
pub(crate) struct EstablishedTunnel {
    completed: CompletedRequest,
    in_scope: bool,
    recorder: Recorder,
}

impl EstablishedTunnel {
    pub(crate) fn id(&self) -> u64 {
        self.completed.id()
    }

    /// Publish a status 500 update for the same id
    pub(crate) async fn fail(self, error: &ProxyError) {
        debug!(id = self.id(), error = %error, "Established tunnel failed");
        if self.in_scope {
            let failed = self.completed.into_failed(error.to_string());
            self.recorder.response(failed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CaptureBody;
    use crate::capture::record::{Protocol, RequestHead};
    use crate::capture::{CaptureStore, EventBus, EventKind, ProxyEvent};
    use crate::http_client::HttpClientError;
    use bytes::Bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http_body_util::{BodyExt, Full};
    use std::io::Write;
    use std::sync::Arc;

    fn pending() -> PendingRequest {
        PendingRequest::new(RequestHead {
            host: "example.com".to_string(),
            port: 80,
            method: "POST".to_string(),
            path: "/submit".to_string(),
            protocol: Protocol::Http,
            headers: HeaderList::new(),
        })
    }

    fn recorder() -> Recorder {
        Recorder::new(EventBus::new(16), Arc::new(CaptureStore::new(16)))
    }

    #[tokio::test]
    async fn test_request_precedes_response_even_if_response_arrives_first() {
        let recorder = recorder();
        let mut events = recorder.bus().subscribe();

        let exchange = Exchange::new(pending(), true, recorder.clone(), 1024);
        let id = exchange.id();
        let (request_body, request_handle) =
            CaptureBody::new(Full::new(Bytes::from_static(b"form=1")), 1024);
        let (response_body, response_handle) =
            CaptureBody::new(Full::new(Bytes::from_static(b"ok")), 1024);
        let (tx, rx) = oneshot::channel();
        exchange.spawn(request_handle, rx);

        // Response fully drained before the request body is read
        response_body.collect().await.unwrap();
        tx.send(UpstreamOutcome::Received {
            status: 200,
            headers: HeaderList::new(),
            content_encoding: None,
            body: response_handle,
        })
        .ok();
        request_body.collect().await.unwrap();

        match events.recv().await {
            Some(ProxyEvent::Request { record }) => {
                assert_eq!(record.id, id);
                assert_eq!(record.request_body.as_deref(), Some(&b"form=1"[..]));
            }
            other => panic!("expected request event, got {:?}", other),
        }
        match events.recv().await {
            Some(ProxyEvent::Response { record }) => {
                assert_eq!(record.id, id);
                assert_eq!(record.status, Some(200));
                assert_eq!(record.response_body.as_deref(), Some(&b"ok"[..]));
            }
            other => panic!("expected response event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gzip_response_is_decoded_with_wire_length() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text body").unwrap();
        let gzipped = Bytes::from(encoder.finish().unwrap());
        let gz_len = gzipped.len() as u64;

        let recorder = recorder();
        let mut responses = recorder
            .bus()
            .subscribe_to(&[crate::capture::EventKind::Response]);

        let exchange = Exchange::new(pending(), true, recorder.clone(), 1024);
        let (request_body, request_handle) = CaptureBody::new(Full::new(Bytes::new()), 1024);
        drop(request_body);
        let (response_body, response_handle) = CaptureBody::new(Full::new(gzipped), 1024);
        let (tx, rx) = oneshot::channel();
        exchange.spawn(request_handle, rx);

        tx.send(UpstreamOutcome::Received {
            status: 200,
            headers: HeaderList::new(),
            content_encoding: Some("gzip".to_string()),
            body: response_handle,
        })
        .ok();
        response_body.collect().await.unwrap();

        match responses.recv().await {
            Some(ProxyEvent::Response { record }) => {
                assert_eq!(record.response_body.as_deref(), Some(&b"plain text body"[..]));
                assert_eq!(record.response_length, gz_len);
            }
            other => panic!("expected response event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_records_500() {
        let recorder = recorder();
        let mut responses = recorder
            .bus()
            .subscribe_to(&[crate::capture::EventKind::Response]);

        let exchange = Exchange::new(pending(), true, recorder.clone(), 1024);
        let id = exchange.id();
        let (request_body, request_handle) = CaptureBody::new(Full::new(Bytes::new()), 1024);
        drop(request_body);
        let (tx, rx) = oneshot::channel();
        exchange.spawn(request_handle, rx);
        let error = ProxyError::Upstream(HttpClientError::ConnectionTimeout {
            host: "example.com".to_string(),
            port: 80,
        });
        tx.send(UpstreamOutcome::Failed(error)).ok();

        match responses.recv().await {
            Some(ProxyEvent::Response { record }) => {
                assert_eq!(record.id, id);
                assert_eq!(record.status, Some(500));
                assert_eq!(
                    record.error.as_deref(),
                    Some("Upstream error: Connection to example.com:80 timed out")
                );
            }
            other => panic!("expected response event, got {:?}", other),
        }
        assert_eq!(recorder.store().get(id).await.unwrap().status, Some(500));
    }

    #[tokio::test]
    async fn test_out_of_scope_exchange_is_silent() {
        let recorder = recorder();
        let exchange = Exchange::new(pending(), false, recorder.clone(), 1024);
        let (request_body, request_handle) = CaptureBody::new(Full::new(Bytes::new()), 1024);
        drop(request_body);
        let (tx, rx) = oneshot::channel();
        exchange.spawn(request_handle, rx);
        tx.send(UpstreamOutcome::Failed(ProxyError::Config("boom".to_string())))
            .ok();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(recorder.store().is_empty().await);
    }

    fn connect_pending() -> PendingRequest {
        PendingRequest::new(RequestHead {
            host: "example.com".to_string(),
            port: 443,
            method: "CONNECT".to_string(),
            path: "example.com:443".to_string(),
            protocol: Protocol::Https,
            headers: HeaderList::new(),
        })
    }

    #[tokio::test]
    async fn test_tunnel_response_is_published_on_establishment() {
        let recorder = recorder();
        let mut events = recorder
            .bus()
            .subscribe_to(&[EventKind::Request, EventKind::Response]);

        let capture = TunnelCapture::open(connect_pending(), true, recorder.clone()).await;
        let id = capture.id();
        let established = capture.establish(200, HeaderList::new()).await;
        assert_eq!(established.id(), id);

        assert!(matches!(events.recv().await, Some(ProxyEvent::Request { record }) if record.id == id));
        match events.recv().await {
            Some(ProxyEvent::Response { record }) => {
                assert_eq!(record.id, id);
                assert_eq!(record.status, Some(200));
                assert!(record.error.is_none());
            }
            other => panic!("expected response event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broken_tunnel_publishes_one_failure_update() {
        let recorder = recorder();
        let mut responses = recorder.bus().subscribe_to(&[EventKind::Response]);

        let capture = TunnelCapture::open(connect_pending(), true, recorder.clone()).await;
        let id = capture.id();
        let established = capture.establish(200, HeaderList::new()).await;
        established
            .fail(&ProxyError::Tunnel {
                host: "example.com".to_string(),
                message: "connection reset".to_string(),
            })
            .await;

        match responses.recv().await {
            Some(ProxyEvent::Response { record }) => assert_eq!(record.status, Some(200)),
            other => panic!("expected response event, got {:?}", other),
        }
        match responses.recv().await {
            Some(ProxyEvent::Response { record }) => {
                assert_eq!(record.id, id);
                assert_eq!(record.status, Some(500));
                assert_eq!(
                    record.error.as_deref(),
                    Some("Tunnel to example.com failed: connection reset")
                );
            }
            other => panic!("expected failure update, got {:?}", other),
        }
    }
}
