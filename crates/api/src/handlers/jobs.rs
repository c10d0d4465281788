//! Handlers for the `/jobs` resource.
//!
//! Identity comes from gateway headers via [`Identity`]. Admins can list
//! and manage every job; regular users only their own.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use genorch_core::types::DbId;
use genorch_db::models::job::JobListQuery;
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::identity::Identity;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    /// Generation payload forwarded to the backend unchanged.
    pub prompt: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Enqueue a generation job. Returns 201 with the PENDING job; the queue
/// monitor dispatches it on its next tick.
pub async fn submit_job(
    Identity(requester): Identity,
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let job = state.service.enqueue(requester, &input.prompt).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Supports optional `status`, `limit`, and `offset` query parameters.
pub async fn list_jobs(
    Identity(requester): Identity,
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.service.list(requester, &params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/stats
pub async fn job_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = state.service.stats().await?;
    Ok(Json(DataResponse { data: stats }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
///
/// Client-facing status, including the FIFO position of PENDING jobs.
pub async fn get_job(
    Identity(requester): Identity,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let status = state.service.get_status(job_id, requester).await?;
    Ok(Json(DataResponse { data: status }))
}

// ---------------------------------------------------------------------------
// Cancel / retry
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancels a PENDING or PROCESSING job. Terminal jobs yield 409.
pub async fn cancel_job(
    Identity(requester): Identity,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.service.cancel(job_id, requester).await?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/v1/jobs/{id}/retry
///
/// Re-enqueues a FAILED job as a new job. Returns 201 with the new job.
pub async fn retry_job(
    Identity(requester): Identity,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.service.retry(job_id, requester).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}
