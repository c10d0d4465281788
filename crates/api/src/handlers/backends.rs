//! Handlers for the `/backends` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/backends
///
/// Cached health table; does not probe.
pub async fn list_backends(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let backends = state.service.backends().await;
    Ok(Json(DataResponse { data: backends }))
}

/// POST /api/v1/backends/check
///
/// Probes every backend concurrently and returns the refreshed table.
pub async fn check_backends(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let backends = state.service.check_backends().await;
    Ok(Json(DataResponse { data: backends }))
}

/// GET /api/v1/backends/{id}/capabilities
pub async fn backend_capabilities(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let capabilities = state.service.capabilities(&backend_id).await?;
    Ok(Json(DataResponse { data: capabilities }))
}
