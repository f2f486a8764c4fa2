//! Engine-level errors

use crate::http_client::HttpClientError;
use crate::mitm::error::MitmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] MitmError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] HttpClientError),

    #[error("Tunnel to {host} failed: {message}")]
    Tunnel { host: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
