use anyhow::{Context, Result};
use kproxy::config::ProxyConfig;
use kproxy::engine::ProxyEngine;
use kproxy::logger;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProxyConfig::from_env()?;

    logger::init_tracing(config.log_json);
    logger::install_panic_hook();

    info!(
        version = kproxy::VERSION,
        data_dir = %config.data_dir.display(),
        "Starting KProxy"
    );

    let port = config.port;
    let engine = ProxyEngine::new(config).context("Failed to create proxy engine")?;

    // Events go to stdout as JSON lines; logs stay on the subscriber
    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }
    });

    let state = engine
        .start(port)
        .await
        .with_context(|| format!("Failed to start proxy on port {}", port))?;
    info!(
        port = state.port,
        ssl_interception = state.ssl_interception_enabled,
        certificate = %state.certificate_path.display(),
        "Proxy running"
    );
    if state.ssl_interception_enabled {
        info!("{}", engine.certificate_instructions());
    }

    shutdown_signal().await;
    info!("Shutting down proxy...");
    engine.stop().await;

    // Let the printer flush the final `stopped` event
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Event printer did not finish in time");
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
