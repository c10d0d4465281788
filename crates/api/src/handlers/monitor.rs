//! Handlers for the `/monitor` resource.
//!
//! Starting is idempotent and open to any caller; stopping requires admin.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::middleware::identity::RequireAdmin;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/monitor
pub async fn monitor_status(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let status = state.service.monitor().status().await;
    Ok(Json(DataResponse { data: status }))
}

/// POST /api/v1/monitor/start
///
/// Returns the monitor status; a second start leaves a single loop running.
pub async fn start_monitor(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let monitor = state.service.monitor();
    if monitor.start().await {
        tracing::info!("Queue monitor started via API");
    }
    Ok(Json(DataResponse {
        data: monitor.status().await,
    }))
}

/// POST /api/v1/monitor/stop
///
/// Waits for the in-flight tick to finish before returning.
pub async fn stop_monitor(
    RequireAdmin(requester): RequireAdmin,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let monitor = state.service.monitor();
    if monitor.stop().await {
        tracing::info!(user_id = ?requester.user_id, "Queue monitor stopped via API");
    }
    Ok(Json(DataResponse {
        data: monitor.status().await,
    }))
}
