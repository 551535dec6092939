//! lexbill service - HTTP API for credits, plan payments and metered AI usage
//!
//! This is the main entry point for the lexbill service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexbill_service::billing::jobs;
use lexbill_service::{create_router, AppState, ServiceConfig};
use lexbill_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lexbill=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting lexbill service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        payos_configured = %config.payos.is_some(),
        ai_configured = %config.ai.is_some(),
        admin_configured = %config.admin_api_key.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config.data_dir)?;

    // Build app state
    let state = AppState::new(store, config.clone());

    // Background jobs stop when the server does
    let shutdown = CancellationToken::new();
    let job_handles = jobs::spawn_all(&state, &shutdown);

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for handle in job_handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background job ended abnormally");
        }
    }
    tracing::info!("lexbill service stopped");

    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(data_dir: &str) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %data_dir, "Opening RocksDB store");
    Ok(Arc::new(lexbill_store::RocksStore::open(data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(data_dir: &str) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!(
        path = %data_dir,
        "Built without rocksdb-backend; using the in-memory store, state is lost on restart"
    );
    Ok(Arc::new(lexbill_store::MemoryStore::new()))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        }
        () = shutdown.cancelled() => {}
    }
}
