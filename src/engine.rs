//! Proxy engine: lifecycle and control surface
//!
//! A [`ProxyEngine`] owns the listener, the runtime settings, the capture
//! store and the lazily created root CA. Connection handling lives in
//! [`crate::server`]; this module starts and stops it.

use crate::capture::{
    CaptureStore, EventBus, EventKind, EventSubscription, ProxyEvent, Recorder, RequestRecord,
};
use crate::config::{ProxyConfig, ProxySettings, SettingsUpdate};
use crate::error::{ProxyError, Result};
use crate::headers::parse_custom_headers;
use crate::http_client::UpstreamClient;
use crate::mitm::{CacheStats, CertificateAuthority, MitmError, UpstreamTlsConfig};
use crate::scope::ScopeRules;
use crate::server::{serve_http1, ProxyHandle, Route};
use crate::shutdown::{ConnectionTracker, ShutdownOutcome};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Stopped,
    Starting,
    Running { port: u16 },
    Stopping,
}

/// Snapshot returned by [`ProxyEngine::status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub is_running: bool,
    pub port: u16,
    pub ssl_interception_enabled: bool,
    pub save_only_in_scope: bool,
    pub custom_headers: BTreeMap<String, String>,
    pub scope_rules: ScopeRules,
    pub certificate_path: PathBuf,
}

/// State shared by every connection task
pub(crate) struct ProxyContext {
    pub(crate) config: ProxyConfig,
    settings: RwLock<Arc<ProxySettings>>,
    pub(crate) recorder: Recorder,
    pub(crate) upstream: UpstreamClient,
    ca: OnceCell<Arc<CertificateAuthority>>,
}

impl ProxyContext {
    /// Settings in effect for a new exchange
    pub(crate) async fn settings(&self) -> Arc<ProxySettings> {
        Arc::clone(&*self.settings.read().await)
    }

    /// Root CA, loading or generating it on first use
    pub(crate) async fn certificate_authority(
        &self,
    ) -> std::result::Result<Arc<CertificateAuthority>, MitmError> {
        self.ca
            .get_or_try_init(|| async {
                CertificateAuthority::initialize(self.config.ca.clone())
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }
}

struct RunningServer {
    tracker: ConnectionTracker,
    accept_task: JoinHandle<()>,
}

pub struct ProxyEngine {
    ctx: Arc<ProxyContext>,
    lifecycle: Mutex<Option<RunningServer>>,
    phase: watch::Sender<EnginePhase>,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let upstream_tls = UpstreamTlsConfig::new(config.verify_upstream_tls)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        parse_custom_headers(&config.settings.custom_headers).map_err(ProxyError::Config)?;

        let upstream = UpstreamClient::new(&upstream_tls, config.connect_timeout);
        let recorder = Recorder::new(
            EventBus::new(config.event_capacity),
            Arc::new(CaptureStore::new(config.max_captured_requests)),
        );
        let (phase, _) = watch::channel(EnginePhase::Stopped);

        Ok(Self {
            ctx: Arc::new(ProxyContext {
                settings: RwLock::new(Arc::new(config.settings.clone())),
                config,
                recorder,
                upstream,
                ca: OnceCell::new(),
            }),
            lifecycle: Mutex::new(None),
            phase,
        })
    }

    #[cfg(test)]
    pub(crate) fn handle_for(&self, local_addr: SocketAddr) -> ProxyHandle {
        ProxyHandle {
            ctx: Arc::clone(&self.ctx),
            tracker: ConnectionTracker::new(),
            local_addr,
        }
    }

    /// Start listening on `port` (0 picks a free port)
    ///
    /// Returns the current state unchanged when already running.
    pub async fn start(&self, port: u16) -> Result<RuntimeState> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("Proxy already running");
            return Ok(self.status().await);
        }
        self.phase.send_replace(EnginePhase::Starting);

        match self.bind(port).await {
            Ok((listener, local_addr)) => {
                let bound = local_addr.port();
                let tracker = ConnectionTracker::new();
                let handle = ProxyHandle {
                    ctx: Arc::clone(&self.ctx),
                    tracker: tracker.clone(),
                    local_addr,
                };
                let accept_task = tokio::spawn(accept_loop(listener, handle));
                *lifecycle = Some(RunningServer {
                    tracker,
                    accept_task,
                });
                self.phase.send_replace(EnginePhase::Running { port: bound });

                info!(host = %self.ctx.config.host, port = bound, "Proxy listening");
                self.ctx
                    .recorder
                    .bus()
                    .publish(ProxyEvent::Started { port: bound });
                Ok(self.status().await)
            }
            Err(e) => {
                error!(error = %e, "Failed to start proxy");
                self.phase.send_replace(EnginePhase::Stopped);
                self.ctx.recorder.error(e.to_string());
                Err(e)
            }
        }
    }

    async fn bind(&self, port: u16) -> Result<(TcpListener, SocketAddr)> {
        if self.ctx.settings().await.ssl_interception_enabled {
            self.ctx.certificate_authority().await?;
        }

        let host = self.ctx.config.host.as_str();
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Stop accepting, drain connections, then force the rest closed
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            debug!("Proxy already stopped");
            return;
        };
        self.phase.send_replace(EnginePhase::Stopping);

        running.accept_task.abort();
        let _ = running.accept_task.await;

        match running.tracker.shutdown(self.ctx.config.shutdown_grace).await {
            ShutdownOutcome::Drained => info!("All connections drained"),
            ShutdownOutcome::Forced { remaining } => {
                warn!(remaining, "Connections closed after grace period")
            }
        }

        self.phase.send_replace(EnginePhase::Stopped);
        self.ctx.recorder.bus().publish(ProxyEvent::Stopped);
        info!("Proxy stopped");
    }

    /// Apply a partial settings update to new exchanges
    pub async fn configure(&self, update: SettingsUpdate) -> Result<RuntimeState> {
        if let Some(headers) = &update.custom_headers {
            parse_custom_headers(headers).map_err(ProxyError::Config)?;
        }
        if update.ssl_interception_enabled == Some(true) {
            self.ctx.certificate_authority().await?;
        }

        {
            let mut guard = self.ctx.settings.write().await;
            let mut next = ProxySettings::clone(&guard);
            if let Some(headers) = update.custom_headers {
                next.custom_headers = headers;
            }
            if let Some(enabled) = update.ssl_interception_enabled {
                next.ssl_interception_enabled = enabled;
            }
            if let Some(save_only_in_scope) = update.save_only_in_scope {
                next.save_only_in_scope = save_only_in_scope;
            }
            if let Some(rules) = update.scope_rules {
                next.scope_rules = rules;
            }
            info!(
                ssl_interception_enabled = next.ssl_interception_enabled,
                save_only_in_scope = next.save_only_in_scope,
                custom_headers = next.custom_headers.len(),
                "Settings updated"
            );
            *guard = Arc::new(next);
        }

        Ok(self.status().await)
    }

    pub async fn status(&self) -> RuntimeState {
        let settings = self.ctx.settings().await;
        let (is_running, port) = match self.phase() {
            EnginePhase::Running { port } => (true, port),
            _ => (false, self.ctx.config.port),
        };

        RuntimeState {
            is_running,
            port,
            ssl_interception_enabled: settings.ssl_interception_enabled,
            save_only_in_scope: settings.save_only_in_scope,
            custom_headers: settings.custom_headers.clone(),
            scope_rules: settings.scope_rules.clone(),
            certificate_path: self.ctx.config.ca.cert_path.clone(),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<EnginePhase> {
        self.phase.subscribe()
    }

    /// Root certificate PEM, creating the CA if needed
    pub async fn export_root_certificate(&self) -> Result<String> {
        let ca = self.ctx.certificate_authority().await?;
        Ok(ca.root_certificate_pem().to_string())
    }

    /// Write the root certificate PEM to `path`
    pub async fn export_root_certificate_to(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let pem = self.export_root_certificate().await?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, pem).await?;
        info!(path = %path.display(), "Root certificate exported");
        Ok(path.to_path_buf())
    }

    /// Per-platform steps for trusting the exported root certificate
    pub fn certificate_instructions(&self) -> String {
        let file = self.ctx.config.ca.cert_path.display();
        format!(
            "Install the KProxy root certificate ({file}) to intercept HTTPS traffic.\n\
             \n\
             Windows: double-click the file, choose \"Install Certificate\", select \"Local Machine\" \
             and place it in \"Trusted Root Certification Authorities\".\n\
             macOS: open the file in Keychain Access, add it to the System keychain, then set \
             \"When using this certificate\" to \"Always Trust\".\n\
             Linux: copy the file to /usr/local/share/ca-certificates/kproxy.crt and run \
             `sudo update-ca-certificates`.\n\
             Firefox: Settings > Privacy & Security > Certificates > View Certificates > \
             Authorities > Import, then trust it for identifying websites.\n"
        )
    }

    /// Leaf cache statistics, if the CA has been created
    pub async fn certificate_cache_stats(&self) -> Option<CacheStats> {
        match self.ctx.ca.get() {
            Some(ca) => Some(ca.cache_stats().await),
            None => None,
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.ctx.recorder.bus().subscribe()
    }

    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscription {
        self.ctx.recorder.bus().subscribe_to(kinds)
    }

    /// Stored records, newest first
    pub async fn captured_requests(&self) -> Vec<RequestRecord> {
        self.ctx.recorder.store().list().await
    }

    pub async fn captured_request(&self, id: u64) -> Option<RequestRecord> {
        self.ctx.recorder.store().get(id).await
    }

    pub async fn clear_captured_requests(&self) {
        self.ctx.recorder.store().clear().await;
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.lifecycle.try_lock() {
            if let Some(running) = lifecycle.take() {
                running.accept_task.abort();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, handle: ProxyHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(peer = %peer, "Accepted connection");

                let conn = handle.clone();
                handle.tracker.spawn(async move {
                    serve_http1(TokioIo::new(stream), conn, Route::Plain).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                handle
                    .ctx
                    .recorder
                    .error(format!("Failed to accept connection: {}", e));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::KeyAlgorithm;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, interception: bool) -> ProxyEngine {
        let mut config = ProxyConfig::with_data_dir(dir.path());
        config.ca.key_algorithm = KeyAlgorithm::EcdsaP256;
        config.settings.ssl_interception_enabled = interception;
        config.shutdown_grace = Duration::from_millis(200);
        ProxyEngine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_start_reports_bound_port_and_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut events = engine.subscribe();

        let state = engine.start(0).await.unwrap();
        assert!(state.is_running);
        assert_ne!(state.port, 0);
        assert_eq!(engine.phase(), EnginePhase::Running { port: state.port });
        assert_eq!(
            events.recv().await,
            Some(ProxyEvent::Started { port: state.port })
        );

        // Second start is a no-op
        assert_eq!(engine.start(0).await.unwrap().port, state.port);

        engine.stop().await;
        assert_eq!(engine.phase(), EnginePhase::Stopped);
        assert_eq!(events.recv().await, Some(ProxyEvent::Stopped));
        engine.stop().await;
        assert!(!engine.status().await.is_running);
    }

    #[tokio::test]
    async fn test_start_with_interception_creates_ca() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, true);

        engine.start(0).await.unwrap();
        assert!(dir.path().join("certificates/ca.crt").exists());
        assert!(dir.path().join("certificates/ca.key").exists());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_configure_is_partial_and_validates_headers() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);

        let state = engine
            .configure(SettingsUpdate {
                save_only_in_scope: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(state.save_only_in_scope);
        assert!(!state.ssl_interception_enabled);

        let err = engine
            .configure(SettingsUpdate {
                custom_headers: Some(BTreeMap::from([(
                    "bad header".to_string(),
                    "x".to_string(),
                )])),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(engine.status().await.custom_headers.is_empty());
    }

    #[tokio::test]
    async fn test_enabling_interception_initializes_ca() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        assert!(engine.certificate_cache_stats().await.is_none());

        let state = engine
            .configure(SettingsUpdate {
                ssl_interception_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(state.ssl_interception_enabled);
        assert!(engine.certificate_cache_stats().await.is_some());
    }

    #[tokio::test]
    async fn test_export_root_certificate_to_file() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);

        let pem = engine.export_root_certificate().await.unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let out = dir.path().join("export/kproxy-ca.crt");
        engine.export_root_certificate_to(&out).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), pem);

        let instructions = engine.certificate_instructions();
        assert!(instructions.contains("ca.crt"));
        assert!(instructions.contains("Firefox"));
    }
}
