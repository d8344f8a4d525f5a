//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::AdmissionService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Log every limiter's status line at this interval.
    pub status_log_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5010,
            status_log_interval: None,
        }
    }
}

/// Start the HTTP server with provided service.
///
/// Returns after shutdown, once every limit controller has stopped.
pub async fn serve(config: ServerConfig, service: Arc<AdmissionService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting admission server on {}", actual_addr);

    let reporter = config
        .status_log_interval
        .map(|interval| tokio::spawn(report_status(Arc::clone(&service), interval)));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    // Controller threads may be mid-fetch; join them off the runtime.
    let stopping = Arc::clone(&service);
    tokio::task::spawn_blocking(move || stopping.stop_controllers()).await?;

    Ok(())
}

async fn report_status(service: Arc<AdmissionService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        service.log_statuses();
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// A signal handler that cannot be installed is logged and never fires.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5010);
        assert!(config.status_log_interval.is_none());
    }

    #[tokio::test]
    async fn serve_exits_on_explicit_shutdown() {
        let service = Arc::new(AdmissionService::new());
        service.register(&LimiterConfig::new("api", 2)).unwrap();

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            status_log_interval: Some(Duration::from_millis(10)),
        };
        let server = tokio::spawn(serve(config, Arc::clone(&service)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        service.trigger_shutdown();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
