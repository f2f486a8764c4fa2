//! MITM Interceptor - TLS termination on an upgraded CONNECT stream
//!
//! After the proxy answers `200 Connection Established`, the interceptor:
//! 1. Accepts the client's TLS handshake with a forged leaf for the target
//! 2. Serves HTTP/1.1 on the decrypted stream
//! 3. Forwards each decrypted request to the origin over fresh upstream TLS
//!
//! No loopback listener is involved; TLS runs directly on the upgraded socket.

use crate::mitm::ca::{CertificateAuthority, LeafCertificate};
use crate::mitm::error::{MitmError, Result};
use crate::mitm::tls_config::ClientTlsConfig;
use crate::server::{serve_http1, ConnectTarget, ProxyHandle, Route};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Terminates client TLS for one CONNECT target
pub struct MitmInterceptor {
    leaf: Arc<LeafCertificate>,
    acceptor: TlsAcceptor,
}

impl MitmInterceptor {
    /// Build an interceptor presenting `leaf`
    pub fn new(leaf: Arc<LeafCertificate>) -> Result<Self> {
        let tls = ClientTlsConfig::for_leaf(&leaf).map_err(|e| MitmError::tls_config(e.to_string()))?;
        Ok(Self {
            leaf,
            acceptor: TlsAcceptor::from(tls.server_config()),
        })
    }

    /// Obtain (or generate) the leaf for `host` and build an interceptor
    pub async fn for_host(ca: &CertificateAuthority, host: &str) -> Result<Self> {
        let leaf = ca.leaf_for(host).await?;
        Self::new(leaf)
    }

    pub fn domain(&self) -> &str {
        self.leaf.domain()
    }

    /// Complete the client's TLS handshake with the forged leaf
    pub(crate) async fn accept(
        &self,
        upgraded: Upgraded,
        host: &str,
    ) -> Result<TlsStream<TokioIo<Upgraded>>> {
        let tls_stream = self
            .acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| MitmError::tls_handshake(host, e.to_string()))?;

        let (_, session) = tls_stream.get_ref();
        debug!(
            domain = %self.domain(),
            sni = ?session.server_name(),
            alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
            "Client TLS established"
        );
        Ok(tls_stream)
    }

    /// Serve the decrypted session until the client closes it
    ///
    /// Per-request errors are recorded on their own exchanges.
    pub(crate) async fn serve(
        tls_stream: TlsStream<TokioIo<Upgraded>>,
        handle: ProxyHandle,
        target: Arc<ConnectTarget>,
    ) {
        serve_http1(
            TokioIo::new(tls_stream),
            handle,
            Route::Intercepted(Arc::clone(&target)),
        )
        .await;
        info!(target_host = %target.host, port = target.port, "Intercepted session closed");
    }
}
