//! smartscale autoscaler
//!
//! Watches cluster load and pending work and scales the worker pool between
//! configured bounds. One tick at a time, guarded by a TTL lock in the state
//! store, so replicas and manual triggers never fight over the same action.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use smartscale_autoscaler::{
    api,
    clients::{
        BlobStore, HttpBlobStore, HttpComputeProvider, HttpOrchestrationApi, PrometheusMetrics,
    },
    config::{Config, StateBackend},
    orchestrator::{Collaborators, Orchestrator, OrchestratorSettings},
    retry::RetryPolicy,
    state::AppState,
    store::{MemoryStateStore, PgStateStore, StateStore},
    ticker::TickWorker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SCALE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting smartscale autoscaler");
    info!(
        cluster = %config.cluster,
        listen_addr = %config.listen_addr,
        min_nodes = config.policy.min_nodes,
        max_nodes = config.policy.max_nodes,
        "Configuration loaded"
    );

    // Connect the state store
    let store: Arc<dyn StateStore> = match config.state_backend {
        StateBackend::Postgres => {
            match PgStateStore::connect(&config.database_url, &config.cluster).await {
                Ok(store) => {
                    info!("State store connection established");
                    Arc::new(store)
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to state store");
                    return Err(e.into());
                }
            }
        }
        StateBackend::Memory => {
            warn!("Using in-memory state store; cluster state will not survive a restart");
            Arc::new(MemoryStateStore::new(&config.cluster, Utc::now()))
        }
    };

    let retry = RetryPolicy::standard(config.call_timeout);
    let blob = Arc::new(HttpBlobStore::new(&config.blob_url, retry));

    // The orchestration API token lives in the blob store next to the node
    // join token.
    let api_token = blob
        .read(&config.api_token_key)
        .await
        .context("Failed to read orchestration API token")?;

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::from_config(&config),
        Collaborators {
            store: store.clone(),
            metrics: Arc::new(PrometheusMetrics::new(
                &config.metrics_url,
                &config.cpu_query,
                &config.pending_query,
                retry,
            )),
            compute: Arc::new(HttpComputeProvider::new(
                &config.compute_url,
                &config.cluster,
                config.worker_subnets.clone(),
                &config.server_addr,
                retry,
            )),
            orch: Arc::new(HttpOrchestrationApi::new(
                &config.orch_url,
                &api_token,
                config.orch_insecure_tls,
                retry,
            )),
            blob: blob.clone(),
        },
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the periodic tick worker in background
    let ticker = TickWorker::new(orchestrator.clone(), config.tick_interval);
    let ticker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            ticker.run(shutdown_rx).await;
        }
    });

    // Build and run the server
    let state = AppState::new(orchestrator, store);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to the tick worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for tick worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, ticker_handle).await {
        warn!(error = %e, "Tick worker did not shut down in time");
    }

    info!("Autoscaler shutdown complete");
    Ok(())
}
