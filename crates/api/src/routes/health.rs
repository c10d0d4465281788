use axum::extract::State;
use axum::{routing::get, Json, Router};
use genorch_core::backend::BackendHealth;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the queue monitor loop is running.
    pub monitor_running: bool,
    /// Backends that answered their last probe.
    pub healthy_backends: usize,
    pub total_backends: usize,
}

/// GET /health -- returns service, monitor and backend health.
///
/// Uses the cached health table; never probes backends itself.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let monitor_running = state.service.monitor().is_running().await;
    let backends = state.service.backends().await;
    let healthy_backends = backends
        .iter()
        .filter(|b| b.status.health == BackendHealth::Healthy)
        .count();

    let status = if monitor_running && healthy_backends > 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        monitor_running,
        healthy_backends,
        total_backends: backends.len(),
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
