//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides TLS interception for the capture proxy.
//! It includes:
//! - Root Certificate Authority management persisted under the data directory
//! - On-the-fly leaf certificate generation with a single-flight cache
//! - TLS configuration for the client-facing and upstream sides
//! - TLS termination on upgraded CONNECT streams

pub mod ca;
pub mod cert_cache;
pub mod error;
pub mod interceptor;
pub mod tls_config;

// Re-export main types
pub use ca::{CaConfig, CertificateAuthority, KeyAlgorithm, LeafCertificate};
pub use cert_cache::{CacheStats, CertCache};
pub use error::MitmError;
pub use interceptor::MitmInterceptor;
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, UpstreamTlsConfig};
