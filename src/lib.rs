//! KProxy - MITM HTTP/HTTPS interception proxy core
//!
//! KProxy sits between a client application and the network, decrypts HTTPS
//! with leaf certificates issued on the fly by a local root CA, and records
//! every request/response pair while forwarding the bytes untouched.
//!
//! ## Features
//!
//! - **HTTP/1.1 forwarding**: absolute-form proxy requests with streamed bodies
//! - **CONNECT tunnels**: blind splicing, or TLS interception with forged leaves
//! - **WebSocket relay**: upgrade handshake forwarded, frames spliced untouched
//! - **Capture**: decompressed bodies, timing and wire size per exchange
//! - **Scope filtering**: `*.suffix` wildcards with exclusions that always win
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kproxy::{ProxyConfig, ProxyEngine, ProxyEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ProxyEngine::new(ProxyConfig::with_data_dir("/tmp/kproxy"))?;
//!     let mut events = engine.subscribe();
//!
//!     let state = engine.start(8080).await?;
//!     println!("listening on {}", state.port);
//!
//!     while let Some(event) = events.recv().await {
//!         if let ProxyEvent::Response { record } = event {
//!             println!("{} {}{} -> {:?}", record.method, record.host, record.path, record.status);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - root CA, leaf cache, TLS configs, TLS termination
//! - `scope` - in/out-of-scope host matching
//! - `capture` - records, capture store, event bus
//! - `engine` - lifecycle and control surface
//! - `server` - per-connection HTTP/1.1 handling
//! - `http_client` - upstream connections

// Core proxy modules
pub mod config;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod logger;
pub mod server;

// Request handling
pub mod body;
pub mod decompress;
pub mod headers;
pub mod shutdown;

// Capture & filtering
pub mod capture;
pub mod scope;

// MITM
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::{ProxyConfig, ProxySettings, SettingsUpdate};

/// Engine
pub use engine::{EnginePhase, ProxyEngine, RuntimeState};
pub use error::ProxyError;

/// Capture model and events
pub use capture::{
    CaptureStore, EventBus, EventKind, EventSubscription, Protocol, ProxyEvent, RequestRecord,
};

/// Scope filtering
pub use scope::{is_in_scope, ScopeRules};

/// MITM types
pub use mitm::{CaConfig, CertificateAuthority, KeyAlgorithm, LeafCertificate, MitmError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
