//! `/health`, `/ready`, `/` — liveness/readiness probes (ambient stack; not
//! named in §6 but standard for a long-running service).

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::api::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ready", get(ready))
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "openspc",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
struct ReadinessStatus {
    ready: bool,
    live_connections: usize,
}

/// Reports live-subscriber connection count as a cheap proxy for "the
/// process's background subsystems are up"; it does not probe the database
/// directly, since a failed probe would itself need a pool checkout on the
/// request path.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessStatus>) {
    let status = ReadinessStatus {
        ready: true,
        live_connections: state.broadcaster.connection_count(),
    };
    (StatusCode::OK, Json(status))
}
