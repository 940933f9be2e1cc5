//! # Monitor endpoint.
//!
//! A small HTTP surface on the master exposing the live [`ClusterStats`]
//! as JSON. The monitor port is bound exclusively (no `SO_REUSEPORT`): a
//! bind failure here means another supervisor instance is already running
//! against the same registry, which is fatal at startup.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::stats::ClusterStats;

type SharedStats = Arc<RwLock<ClusterStats>>;

/// Builds the monitor router: `GET /` returns the stats snapshot.
pub fn router(stats: SharedStats) -> Router {
    Router::new().route("/", get(snapshot)).with_state(stats)
}

async fn snapshot(State(stats): State<SharedStats>) -> Json<ClusterStats> {
    Json(stats.read().await.clone())
}

/// Serves the monitor on an already-bound listener until `token` cancels.
pub async fn serve(
    listener: TcpListener,
    stats: SharedStats,
    token: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(stats))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
}
