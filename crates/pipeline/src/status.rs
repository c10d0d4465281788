//! Client-facing projection of a job record.

use genorch_core::job_status::JobStatus;
use genorch_core::types::{DbId, Timestamp};
use genorch_db::models::job::Job;
use serde::Serialize;

/// What a caller polling a job gets back.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: DbId,
    pub state: JobStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub backend_id: Option<String>,
    pub backend_prompt_id: Option<String>,
    pub attempts: i32,
    /// 1-based position among PENDING jobs; `None` once dispatched.
    pub queue_position: Option<usize>,
    pub result: Option<serde_json::Value>,
    pub retry_of_job_id: Option<DbId>,
}

impl JobStatusView {
    pub fn new(job: Job, queue_position: Option<usize>) -> Self {
        Self {
            id: job.id,
            state: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
            backend_id: job.backend_id,
            backend_prompt_id: job.backend_prompt_id,
            attempts: job.attempts,
            queue_position,
            result: job.result,
            retry_of_job_id: job.retry_of_job_id,
        }
    }
}

/// 1-based FIFO position of `job_id` in `pending`.
pub fn queue_position(pending: &[Job], job_id: DbId) -> Option<usize> {
    pending.iter().position(|j| j.id == job_id).map(|i| i + 1)
}
