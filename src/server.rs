//! HTTP/1.1 proxy front end
//!
//! Plain proxy connections and decrypted CONNECT sessions share one request
//! handler. Plain connections carry absolute-form requests, CONNECT and
//! WebSocket upgrades; decrypted sessions carry origin-form requests bound
//! for the CONNECT target.

use crate::body::CaptureBody;
use crate::capture::exchange::{Exchange, TunnelCapture, UpstreamOutcome};
use crate::capture::{header_list, HeaderList, PendingRequest, Protocol, RequestHead};
use crate::engine::ProxyContext;
use crate::error::ProxyError;
use crate::headers::{
    apply_custom_headers, content_encoding, ensure_host, is_websocket_upgrade, strip_hop_by_hop,
};
use crate::http_client::{Scheme, UpstreamTarget};
use crate::mitm::MitmInterceptor;
use crate::shutdown::ConnectionTracker;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Body type of every response the proxy writes
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

// Boxed: intercepted sessions re-enter this handler
type ResponseFuture = Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, Infallible>> + Send>>;

pub(crate) type ConnectionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Shared state plus the tracker of the running listener
#[derive(Clone)]
pub(crate) struct ProxyHandle {
    pub(crate) ctx: Arc<ProxyContext>,
    pub(crate) tracker: ConnectionTracker,
    /// Address the listener is bound to
    pub(crate) local_addr: SocketAddr,
}

impl ProxyHandle {
    /// Whether `target` is this proxy's own listener
    pub(crate) fn is_own_listener(&self, target: &UpstreamTarget) -> bool {
        if target.port != self.local_addr.port() {
            return false;
        }
        let host = target.host.trim_end_matches('.');
        if host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case(&self.ctx.config.host)
        {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback() || ip.is_unspecified() || ip == self.local_addr.ip(),
            Err(_) => false,
        }
    }
}

/// Destination named by a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// Where requests on a connection are headed
#[derive(Debug, Clone)]
pub(crate) enum Route {
    /// Client talks to the proxy directly
    Plain,
    /// Decrypted session inside a CONNECT tunnel
    Intercepted(Arc<ConnectTarget>),
}

/// Parse and validate CONNECT authority (host:port)
/// Returns (host, port) or error message
pub(crate) fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    // Split by last colon to handle IPv6 addresses like [::1]:443
    let parts: Vec<&str> = authority.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err("Authority must be in host:port format".to_string());
    }

    let port_str = parts[0];
    let host = parts[1];
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;

    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}

/// Path plus query in origin form, always starting with `/`
fn origin_form(uri: &Uri) -> String {
    match uri.path_and_query().map(|pq| pq.as_str()) {
        Some(pq) if pq.starts_with('/') => pq.to_string(),
        Some(pq) => format!("/{}", pq),
        None => "/".to_string(),
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Serve HTTP/1.1 on `io` until the client closes it or the listener drains
///
/// Boxed so the intercepted path, which serves again from inside a spawned
/// tunnel task, has a nameable `Send` future.
pub(crate) fn serve_http1<I>(io: I, handle: ProxyHandle, route: Route) -> ConnectionFuture
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    Box::pin(serve_connection(io, handle, route))
}

async fn serve_connection<I>(io: I, handle: ProxyHandle, route: Route)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let tracker = handle.tracker.clone();
    let service = service_fn(move |req| -> ResponseFuture {
        let handle = handle.clone();
        let route = route.clone();
        Box::pin(async move { Ok(handle_request(req, handle, route).await) })
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades(); // CONNECT and WebSocket
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(error = %e, "HTTP/1.1 connection closed with error");
                }
                break;
            }
            _ = tracker.draining(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    handle: ProxyHandle,
    route: Route,
) -> Response<ProxyBody> {
    debug!(method = %req.method(), uri = %req.uri(), "Received request");

    if req.method() == Method::CONNECT {
        return match route {
            Route::Plain => handle_connect(req, handle).await,
            Route::Intercepted(_) => text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "CONNECT is not supported inside an intercepted tunnel",
            ),
        };
    }

    let target = match &route {
        Route::Plain => match UpstreamTarget::from_request(req.uri(), req.headers()) {
            Some(target) if handle.is_own_listener(&target) => {
                warn!(target = %target, "[HTTP] Request addressed to the proxy itself");
                return text_response(
                    StatusCode::BAD_REQUEST,
                    "Bad Request: request addressed to the proxy itself",
                );
            }
            Some(target) => target,
            None => {
                warn!(uri = %req.uri(), "[HTTP] Request without a target host");
                return text_response(StatusCode::BAD_REQUEST, "Bad Request: missing host");
            }
        },
        Route::Intercepted(connect) => {
            UpstreamTarget::new(Scheme::Https, connect.host.clone(), connect.port)
        }
    };

    if is_websocket_upgrade(req.headers()) {
        relay_websocket(req, handle, target).await
    } else {
        forward_http_request(req, handle, target).await
    }
}

/// Forward one request to the origin, streaming both bodies through capture
async fn forward_http_request(
    req: Request<Incoming>,
    handle: ProxyHandle,
    target: UpstreamTarget,
) -> Response<ProxyBody> {
    let ctx = &handle.ctx;
    let settings = ctx.settings().await;
    let limit = ctx.config.max_capture_body_bytes;

    let (mut parts, body) = req.into_parts();
    let path = origin_form(&parts.uri);

    strip_hop_by_hop(&mut parts.headers, false);
    apply_custom_headers(&mut parts.headers, &settings.custom_headers);
    ensure_host(&mut parts.headers, &target.authority());

    let protocol = match target.scheme {
        Scheme::Http => Protocol::Http,
        Scheme::Https => Protocol::Https,
    };
    let pending = PendingRequest::new(RequestHead {
        host: target.host.clone(),
        port: target.port,
        method: parts.method.to_string(),
        path: path.clone(),
        protocol,
        headers: header_list(&parts.headers),
    });

    let exchange = Exchange::new(
        pending,
        settings.should_capture(&target.host),
        ctx.recorder.clone(),
        limit,
    );
    let id = exchange.id();
    let (request_body, request_capture) = CaptureBody::new(body, limit);
    let (upstream_tx, upstream_rx) = oneshot::channel();
    exchange.spawn(request_capture, upstream_rx);

    debug!(id, method = %parts.method, target = %target, path = %path, "[HTTP] Forwarding");

    parts.uri = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
    parts.version = Version::HTTP_11;
    let upstream_req = Request::from_parts(parts, request_body);

    match ctx.upstream.send(&target, upstream_req).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            let status = parts.status.as_u16();
            let encoding = content_encoding(&parts.headers);
            let headers = header_list(&parts.headers);
            strip_hop_by_hop(&mut parts.headers, false);

            let (body, response_capture) = CaptureBody::new(body, limit);
            let _ = upstream_tx.send(UpstreamOutcome::Received {
                status,
                headers,
                content_encoding: encoding,
                body: response_capture,
            });

            debug!(id, status, "[HTTP] Origin responded");
            Response::from_parts(parts, body.boxed_unsync())
        }
        Err(e) => {
            warn!(id, target = %target, error = %e, "[HTTP] Upstream request failed");
            let page = format!("Proxy error: {}", e);
            let _ = upstream_tx.send(UpstreamOutcome::Failed(ProxyError::Upstream(e)));
            text_response(StatusCode::INTERNAL_SERVER_ERROR, page)
        }
    }
}

/// Handle HTTP/1.1 CONNECT: blind tunnel or TLS interception
async fn handle_connect(req: Request<Incoming>, handle: ProxyHandle) -> Response<ProxyBody> {
    let authority = match req.uri().authority() {
        Some(auth) => auth.to_string(),
        None => {
            warn!("[CONNECT] Missing authority in CONNECT request");
            return text_response(
                StatusCode::BAD_REQUEST,
                "Bad Request: CONNECT requires a valid host:port authority",
            );
        }
    };

    let (host, port) = match parse_authority(&authority) {
        Ok(parsed) => parsed,
        Err(err_msg) => {
            warn!("[CONNECT] Invalid authority {}: {}", authority, err_msg);
            return text_response(StatusCode::BAD_REQUEST, format!("Bad Request: {}", err_msg));
        }
    };

    let settings = handle.ctx.settings().await;
    let pending = PendingRequest::new(RequestHead {
        host: host.clone(),
        port,
        method: Method::CONNECT.to_string(),
        path: authority.clone(),
        protocol: Protocol::Https,
        headers: header_list(req.headers()),
    });
    let capture = TunnelCapture::open(
        pending,
        settings.should_capture(&host),
        handle.ctx.recorder.clone(),
    )
    .await;

    info!(
        id = capture.id(),
        target_host = %authority,
        intercept = settings.ssl_interception_enabled,
        "[CONNECT] Tunnel requested"
    );

    let target = ConnectTarget { host, port };
    if settings.ssl_interception_enabled {
        intercept_connect(req, handle, capture, target).await
    } else {
        tunnel_connect(req, handle, capture, target).await
    }
}

/// Splice client and origin without looking inside
async fn tunnel_connect(
    mut req: Request<Incoming>,
    handle: ProxyHandle,
    capture: TunnelCapture,
    target: ConnectTarget,
) -> Response<ProxyBody> {
    let mut upstream = match handle.ctx.upstream.connect(&target.host, target.port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target_host = %target.host, port = target.port, error = %e, "[CONNECT] Failed to connect");
            capture.fail(&ProxyError::Upstream(e)).await;
            return text_response(StatusCode::BAD_GATEWAY, "Failed to connect to target");
        }
    };

    handle.tracker.spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(target_host = %target.host, error = %e, "[CONNECT] Upgrade error");
                capture
                    .fail(&tunnel_error(&target, format!("Upgrade failed: {}", e)))
                    .await;
                return;
            }
        };

        let established = capture.establish(200, HeaderList::new()).await;
        let mut client = TokioIo::new(upgraded);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((client_to_upstream, upstream_to_client)) => {
                info!(
                    id = established.id(),
                    target_host = %target.host,
                    client_to_upstream,
                    upstream_to_client,
                    "[CONNECT] Tunnel closed"
                );
            }
            Err(e) => {
                debug!(target_host = %target.host, error = %e, "[CONNECT] Tunnel failed");
                established.fail(&tunnel_error(&target, e.to_string())).await;
            }
        }
    });

    connection_established()
}

/// Terminate client TLS with a forged leaf and serve the decrypted session
async fn intercept_connect(
    mut req: Request<Incoming>,
    handle: ProxyHandle,
    capture: TunnelCapture,
    target: ConnectTarget,
) -> Response<ProxyBody> {
    let prepared = match handle.ctx.certificate_authority().await {
        Ok(ca) => MitmInterceptor::for_host(&ca, &target.host).await,
        Err(e) => Err(e),
    };
    let interceptor = match prepared {
        Ok(interceptor) => interceptor,
        Err(e) => {
            warn!(target_host = %target.host, error = %e, "[CONNECT] Cannot intercept");
            capture.fail(&ProxyError::Certificate(e)).await;
            return text_response(StatusCode::BAD_GATEWAY, "Failed to prepare interception");
        }
    };

    let session = handle.clone();
    let target = Arc::new(target);
    handle.tracker.spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(target_host = %target.host, error = %e, "[CONNECT] Upgrade error");
                capture
                    .fail(&tunnel_error(&target, format!("Upgrade failed: {}", e)))
                    .await;
                return;
            }
        };

        match interceptor.accept(upgraded, &target.host).await {
            Ok(tls_stream) => {
                capture.establish(200, HeaderList::new()).await;
                MitmInterceptor::serve(tls_stream, session, target).await;
            }
            Err(e) => {
                warn!(target_host = %target.host, error = %e, "[CONNECT] Interception failed");
                capture.fail(&ProxyError::Certificate(e)).await;
            }
        }
    });

    connection_established()
}

fn tunnel_error(target: &ConnectTarget, message: impl Into<String>) -> ProxyError {
    ProxyError::Tunnel {
        host: target.host.clone(),
        message: message.into(),
    }
}

/// Forward a WebSocket handshake and splice the upgraded streams
async fn relay_websocket(
    mut req: Request<Incoming>,
    handle: ProxyHandle,
    target: UpstreamTarget,
) -> Response<ProxyBody> {
    let settings = handle.ctx.settings().await;
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (mut parts, _body) = req.into_parts();
    let path = origin_form(&parts.uri);

    strip_hop_by_hop(&mut parts.headers, true);
    apply_custom_headers(&mut parts.headers, &settings.custom_headers);
    ensure_host(&mut parts.headers, &target.authority());

    let pending = PendingRequest::new(RequestHead {
        host: target.host.clone(),
        port: target.port,
        method: "WEBSOCKET".to_string(),
        path: path.clone(),
        protocol: Protocol::WebSocket,
        headers: header_list(&parts.headers),
    });
    let capture = TunnelCapture::open(
        pending,
        settings.should_capture(&target.host),
        handle.ctx.recorder.clone(),
    )
    .await;
    info!(id = capture.id(), target = %target, path = %path, "[WS] Upgrade requested");

    parts.uri = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
    parts.version = Version::HTTP_11;
    let upstream_req = Request::from_parts(parts, Empty::<Bytes>::new());

    let mut response = match handle.ctx.upstream.send(&target, upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(target = %target, error = %e, "[WS] Failed to reach origin");
            capture.fail(&ProxyError::Upstream(e)).await;
            return text_response(StatusCode::BAD_GATEWAY, "Failed to connect to target");
        }
    };

    let status = response.status();
    let headers = header_list(response.headers());

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = status.as_u16(), "[WS] Origin declined upgrade");
        capture.establish(status.as_u16(), headers).await;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, false);
        return Response::from_parts(parts, body.boxed_unsync());
    }

    let origin_upgrade = hyper::upgrade::on(&mut response);
    let established = capture.establish(101, headers).await;
    let host = target.host.clone();

    handle.tracker.spawn(async move {
        let splice_error = |message: String| ProxyError::Tunnel {
            host: host.clone(),
            message,
        };
        match tokio::try_join!(client_upgrade, origin_upgrade) {
            Ok((client, origin)) => {
                let mut client = TokioIo::new(client);
                let mut origin = TokioIo::new(origin);
                match tokio::io::copy_bidirectional(&mut client, &mut origin).await {
                    Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "[WS] Splice closed"),
                    Err(e) => {
                        debug!(error = %e, "[WS] Splice ended with error");
                        established.fail(&splice_error(e.to_string())).await;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "[WS] Upgrade failed");
                established
                    .fail(&splice_error(format!("Upgrade failed: {}", e)))
                    .await;
            }
        }
    });

    let (mut parts, _) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers, true);
    Response::from_parts(parts, empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::engine::ProxyEngine;

    #[test]
    fn test_parse_authority_valid() {
        assert_eq!(
            parse_authority("example.com:443"),
            Ok(("example.com".to_string(), 443))
        );
        assert_eq!(parse_authority("[::1]:8443"), Ok(("::1".to_string(), 8443)));
        assert_eq!(
            parse_authority("10.0.0.1:65535"),
            Ok(("10.0.0.1".to_string(), 65535))
        );
    }

    #[test]
    fn test_parse_authority_invalid() {
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:65536").is_err());
        assert!(parse_authority("example.com:https").is_err());
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://example.com/foo?a=1".parse().unwrap();
        assert_eq!(origin_form(&uri), "/foo?a=1");

        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");

        let uri: Uri = "/bar".parse().unwrap();
        assert_eq!(origin_form(&uri), "/bar");
    }

    fn handle(local_addr: &str) -> (tempfile::TempDir, ProxyHandle) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ProxyConfig::with_data_dir(dir.path());
        config.settings.ssl_interception_enabled = false;
        let engine = ProxyEngine::new(config).unwrap();
        (dir, engine.handle_for(local_addr.parse().unwrap()))
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_connection_future_is_send() {
        let (_dir, handle) = handle("127.0.0.1:8080");
        let (client, _server) = tokio::io::duplex(64);
        let connection = serve_http1(TokioIo::new(client), handle, Route::Plain);
        assert_send(&connection);
    }

    #[tokio::test]
    async fn test_own_listener_is_recognised() {
        let (_dir, handle) = handle("127.0.0.1:8080");
        assert!(handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "127.0.0.1", 8080)));
        assert!(handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "localhost", 8080)));
        assert!(handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "LOCALHOST.", 8080)));
        assert!(handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "[::1]", 8080)));
        assert!(handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "0.0.0.0", 8080)));

        assert!(!handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "127.0.0.1", 8081)));
        assert!(!handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "example.com", 8080)));
        assert!(!handle.is_own_listener(&UpstreamTarget::new(Scheme::Http, "10.1.2.3", 8080)));
    }

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error: boom");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"Proxy error: boom"));
    }
}
