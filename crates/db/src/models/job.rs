//! Job entity models and DTOs.

use genorch_core::job_status::JobStatus;
use genorch_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    /// Submitting user; `None` for anonymous submissions.
    pub user_id: Option<DbId>,
    /// Opaque generation payload forwarded to the backend as-is.
    pub prompt: serde_json::Value,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: JobStatus,
    pub backend_id: Option<String>,
    pub backend_prompt_id: Option<String>,
    #[sqlx(rename = "error_message")]
    pub error: Option<String>,
    pub attempts: i32,
    /// Backend outputs recorded on completion.
    pub result: Option<serde_json::Value>,
    pub retry_of_job_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

/// Query parameters for job listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by status (e.g. `pending`, `failed`).
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Maximum page size for job listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: i64 = 50;

impl JobListQuery {
    /// Effective `(limit, offset)` after defaults and caps.
    pub fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    /// Jobs completed since 00:00 UTC today.
    pub completed_today: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}
