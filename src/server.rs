//! # Health server
//!
//! Liveness endpoint of the daemon. The scheduler has no RPC surface here;
//! `/healthz` only reports whether the datastore answers.

use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::datastore::SharedDatastore;
use crate::migrations::version_key;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub ds: SharedDatastore,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let version = env!("CARGO_PKG_VERSION");
    match state.ds.has(&version_key()).await {
        Ok(_) => (StatusCode::OK, Json(HealthStatus { status: "ok", version })),
        Err(err) => {
            warn!(error = ?err, "Datastore health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable",
                    version,
                }),
            )
        }
    }
}

/// Serves the health endpoint until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
