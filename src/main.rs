use anyhow::{Context, Result};
use picture_service::{
    Config, KafkaEventPublisher, PgMetadataRepository, PictureOrchestrator, PolicySet,
    S3BlobStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting picture service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize adapters
    let metadata = Arc::new(
        PgMetadataRepository::new(&config.database)
            .await
            .context("Failed to initialize metadata repository")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blobs = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob store")?,
    );

    let events = Arc::new(
        KafkaEventPublisher::new(&config.kafka).context("Failed to initialize Kafka publisher")?,
    );

    let orchestrator = PictureOrchestrator::new(
        blobs,
        metadata,
        events,
        PolicySet::from_config(&config.resilience),
        config.orchestrator.clone(),
    );

    let shutdown = CancellationToken::new();

    // Spawn orphan sweeper task
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = orchestrator.sweeper(config.sweeper.clone());
        Some(tokio::spawn(sweeper.run(shutdown.clone())))
    } else {
        info!("Orphan sweeper disabled");
        None
    };

    info!("Picture service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down picture service");

    shutdown.cancel();
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    info!("Picture service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
