use anyhow::{Context, Result};
use inspection_service::aggregator::{refresh_channel, Aggregator, RefreshReason};
use inspection_service::api::{start_api_server, AppState};
use inspection_service::auth::TokenVerifier;
use inspection_service::config::Config;
use inspection_service::photo_store::{PhotoStore, S3PhotoStore};
use inspection_service::record_store::{PgRecordStore, RecordStore};
use inspection_service::session::SessionManager;
use inspection_service::submission::Submitter;
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
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        bucket = %config.storage.bucket,
        "Starting inspection service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize stores
    let pg_store = PgRecordStore::new(&config.database)
        .await
        .context("Failed to initialize record store")?;

    if config.database.run_migrations {
        pg_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let records: Arc<dyn RecordStore> = Arc::new(pg_store);
    let photos: Arc<dyn PhotoStore> = Arc::new(
        S3PhotoStore::new(&config.storage)
            .await
            .context("Failed to initialize photo store")?,
    );

    let tokens = Arc::new(TokenVerifier::new(&config.auth));
    let sessions = Arc::new(SessionManager::new(records.clone()));
    let aggregator = Arc::new(
        Aggregator::new(records.clone(), photos.clone(), config.signed_url_ttl())
            .with_display_offset(config.display.utc_offset()),
    );
    let submitter = Arc::new(Submitter::new(
        records.clone(),
        photos,
        config.storage.upload_concurrency,
    ));

    let shutdown = CancellationToken::new();

    // Spawn refresh loop
    let (refresh, commands) = refresh_channel(config.aggregation.command_buffer);
    let refresh_handle = aggregator.clone().spawn_refresh_loop(
        commands,
        sessions.subscribe(),
        config.aggregation.refresh_on_sign_in,
        shutdown.clone(),
    );

    if !refresh.request(RefreshReason::Startup).await {
        warn!("Refresh loop unavailable at startup");
    }

    let api_state = AppState {
        records,
        tokens,
        sessions,
        aggregator,
        submitter,
        refresh,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Inspection service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down inspection service");
    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    if let Err(e) = refresh_handle.await {
        error!(error = %e, "Refresh loop task failed");
    }

    info!("Inspection service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
