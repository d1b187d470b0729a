//! Read-only HTTP query surface for the seed daemon
//!
//! Exposes metrics, the seeding registry, queue depth and the outcome
//! store summary as JSON. Nothing here mutates pipeline state.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::signalled;
use crate::queue::QueueDepth;
use crate::registry::SeedSummary;
use crate::store::StoreSummary;

/// Errors that can occur when running the query server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(daemon): State<Arc<Daemon>>) -> Json<MetricsSnapshot> {
    Json(daemon.metrics().await)
}

/// Handler for GET /seeds
async fn get_seeds(State(daemon): State<Arc<Daemon>>) -> Json<Vec<SeedSummary>> {
    Json(daemon.list_active().await)
}

async fn get_queue(State(daemon): State<Arc<Daemon>>) -> Json<QueueDepth> {
    Json(daemon.queue_depth())
}

async fn get_store(
    State(daemon): State<Arc<Daemon>>,
) -> Result<Json<StoreSummary>, (StatusCode, String)> {
    daemon.store_summary().await.map(Json).map_err(|e| {
        warn!(error = %e, "Store summary failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Creates the axum Router with all query endpoints
pub fn create_query_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/seeds", get(get_seeds))
        .route("/queue", get(get_queue))
        .route("/store", get(get_store))
        .with_state(daemon)
}

/// Serve the query API on `bind` until `shutdown` turns true.
pub async fn run_query_server(
    daemon: Arc<Daemon>,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let app = create_query_router(daemon);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "Query server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signalled(&mut shutdown).await })
        .await?;

    Ok(())
}
