//! TLS Configuration for interception
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) with forged leaf certificates
//! - Upstream TLS (proxy → origin), which by default trusts any origin
//!   certificate so self-signed or otherwise untrusted origins can still be
//!   captured
//!
//! Both sides speak TLS 1.2/1.3 and negotiate `http/1.1` only.

use super::ca::LeafCertificate;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Client-facing TLS config (proxy acts as server with a forged certificate)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config presenting `cert_chain`
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Server config presenting the leaf for an intercepted domain
    pub fn for_leaf(leaf: &LeafCertificate) -> Result<Self, TlsConfigError> {
        debug!(domain = %leaf.domain(), "Client-facing TLS config created");
        Self::new(leaf.certificate_chain(), leaf.private_key())
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client toward the origin)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
    verifies_certificates: bool,
}

impl UpstreamTlsConfig {
    /// Build the upstream client config
    ///
    /// With `verify_certificates = false` every origin certificate is
    /// accepted. This is an intentional weakening of transport trust for
    /// controlled security testing and is logged as such.
    pub fn new(verify_certificates: bool) -> Result<Self, TlsConfigError> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        let mut config = if verify_certificates {
            let mut root_store = RootCertStore::empty();
            root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
            info!(
                roots_count = TLS_SERVER_ROOTS.len(),
                "Upstream TLS certificate verification enabled"
            );
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            warn!(
                "Upstream TLS certificate verification is DISABLED: any origin certificate is \
                 trusted. Use only for controlled security testing."
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider())))
                .with_no_client_auth()
        };

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
            verifies_certificates: verify_certificates,
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn verifies_certificates(&self) -> bool {
        self.verifies_certificates
    }
}

/// Accepts every server certificate while still checking handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse a host (DNS name or IP literal, brackets allowed) into a ServerName
    pub fn parse_server_name(host: &str) -> Result<ServerName<'static>, TlsConfigError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(host.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", host, e)))
    }
}
