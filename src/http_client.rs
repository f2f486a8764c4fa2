//! Upstream HTTP/1.1 client
//!
//! Opens a fresh TCP (and, for HTTPS, TLS) connection per exchange and drives
//! it with hyper's connection-level client. No pooling: each connection lives
//! exactly as long as the exchange (or upgraded tunnel) that created it.

use crate::mitm::tls_config::{SniUtils, UpstreamTlsConfig};
use http::header::HOST;
use http::{HeaderMap, Request, Response, Uri};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("Connection to {host}:{port} timed out")]
    ConnectionTimeout { host: String, port: u16 },

    #[error("Connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {host} failed: {message}")]
    Tls { host: String, message: String },

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Origin an exchange is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    /// Hostname or IP literal without brackets
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Self { scheme, host, port }
    }

    /// Resolve the origin of a proxied request from its absolute-form URI,
    /// falling back to the `Host` header
    pub fn from_request(uri: &Uri, headers: &HeaderMap) -> Option<Self> {
        let scheme = if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
            Scheme::Https
        } else {
            Scheme::Http
        };

        let authority = match uri.authority() {
            Some(authority) => authority.clone(),
            None => headers.get(HOST)?.to_str().ok()?.parse().ok()?,
        };

        let host = authority.host();
        if host.is_empty() {
            return None;
        }
        let port = authority.port_u16().unwrap_or(scheme.default_port());
        Some(Self::new(scheme, host, port))
    }

    /// `Host` header form: port omitted when default, IPv6 bracketed
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Connects to origins and sends one request per connection
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(tls: &UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(tls.client_config()),
            connect_timeout,
        }
    }

    /// Open a TCP connection to `host:port` within the connect timeout
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, HttpClientError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| HttpClientError::ConnectionTimeout {
                host: host.to_string(),
                port,
            })?
            .map_err(|source| HttpClientError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    /// Send `req` to `target` over a new connection
    ///
    /// The connection task keeps running after the response head arrives so
    /// the body (or an upgraded stream) can still be read.
    pub async fn send<B>(
        &self,
        target: &UpstreamTarget,
        req: Request<B>,
    ) -> Result<Response<Incoming>, HttpClientError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = self.connect(&target.host, target.port).await?;

        match target.scheme {
            Scheme::Http => send_over(TokioIo::new(stream), req).await,
            Scheme::Https => {
                let server_name = SniUtils::parse_server_name(&target.host)
                    .map_err(|e| HttpClientError::InvalidServerName(e.to_string()))?;
                let tls = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| HttpClientError::Tls {
                        host: target.host.clone(),
                        message: e.to_string(),
                    })?;
                debug!(target = %target, "Upstream TLS established");
                send_over(TokioIo::new(tls), req).await
            }
        }
    }
}

async fn send_over<T, B>(io: T, req: Request<B>) -> Result<Response<Incoming>, HttpClientError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(io)
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_target_from_absolute_uri() {
        let uri: Uri = "http://example.com/foo?x=1".parse().unwrap();
        let target = UpstreamTarget::from_request(&uri, &HeaderMap::new()).unwrap();
        assert_eq!(target, UpstreamTarget::new(Scheme::Http, "example.com", 80));

        let uri: Uri = "https://example.com:8443/".parse().unwrap();
        let target = UpstreamTarget::from_request(&uri, &HeaderMap::new()).unwrap();
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn test_target_from_host_header() {
        let uri: Uri = "/foo".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert!(UpstreamTarget::from_request(&uri, &headers).is_none());

        headers.insert(HOST, HeaderValue::from_static("api.example.com:8080"));
        let target = UpstreamTarget::from_request(&uri, &headers).unwrap();
        assert_eq!(target.host, "api.example.com");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_authority_formatting() {
        assert_eq!(
            UpstreamTarget::new(Scheme::Http, "example.com", 80).authority(),
            "example.com"
        );
        assert_eq!(
            UpstreamTarget::new(Scheme::Https, "example.com", 8443).authority(),
            "example.com:8443"
        );
        assert_eq!(
            UpstreamTarget::new(Scheme::Http, "[::1]", 8080).authority(),
            "[::1]:8080"
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = UpstreamClient::new(
            &UpstreamTlsConfig::new(false).unwrap(),
            Duration::from_secs(2),
        );
        let err = client.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, HttpClientError::Connect { .. }));
    }
}
