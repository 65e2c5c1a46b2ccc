use anyhow::{Context, Result};
use loghaven_aggregator::config::{Config, ServiceConfig};
use loghaven_aggregator::health_api::{start_health_server, AppState};
use loghaven_aggregator::maintenance::{run_health_monitor, run_retention};
use loghaven_aggregator::proto::log_aggregator_server::LogAggregatorServer;
use loghaven_aggregator::{open_storage, LogAggregatorService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backend = ?config.storage.backend,
        "Starting log aggregator service"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Storage is verified reachable and healthy before anything listens
    let storage = open_storage(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let service = Arc::new(
        LogAggregatorService::new(storage, config.request_timeout())
            .await
            .context("Failed to initialize log aggregator")?,
    );

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    if config.retention.enabled {
        background.push(tokio::spawn(run_retention(
            service.clone(),
            config.retention_max_age(),
            config.retention_interval(),
            shutdown.clone(),
        )));
    }

    background.push(tokio::spawn(run_health_monitor(
        service.clone(),
        config.monitor_interval(),
        shutdown.clone(),
    )));

    if config.health.enabled {
        let state = AppState {
            service: service.clone(),
            service_name: config.service.name.clone(),
        };
        let health_config = config.health.clone();
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = start_health_server(state, &health_config, token).await {
                error!(error = %e, "Health probe server error");
            }
        }));
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid gRPC listen address")?;

    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(LogAggregatorServer::from_arc(service.clone()))
            .serve_with_shutdown(addr, async move { server_shutdown.cancelled().await }),
    );

    info!(address = %addr, "gRPC server listening");

    // Wait for shutdown signal or an early server exit
    let server_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    info!("Shutting down log aggregator");

    // Stop accepting new RPCs and let in-flight ones drain
    shutdown.cancel();

    match server_result {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => error!(error = %e, "gRPC server error"),
        Some(Err(e)) => error!(error = %e, "gRPC server task failed"),
        None => match tokio::time::timeout(config.shutdown_grace(), &mut server).await {
            Ok(Ok(Ok(()))) => info!("In-flight requests drained"),
            Ok(Ok(Err(e))) => error!(error = %e, "gRPC server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "gRPC server task failed during shutdown"),
            Err(_) => {
                warn!(
                    grace_secs = config.shutdown_grace().as_secs(),
                    "Shutdown grace period elapsed, aborting remaining requests"
                );
                server.abort();
            }
        },
    }

    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    // Release the storage engine only once nothing can reach it
    if let Err(e) = service.close().await {
        error!(error = %e, "Failed to close storage");
    }

    info!("Log aggregator stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
