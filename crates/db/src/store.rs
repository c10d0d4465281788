//! The repository interface for jobs and the rules every implementation
//! shares.
//!
//! Implementations must serialize mutations of a single job so that an
//! illegal transition is rejected even when two writers race.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use genorch_core::error::CoreError;
use genorch_core::job_status::JobStatus;
use genorch_core::types::{DbId, Timestamp};

use crate::models::job::{Job, JobListQuery, JobStats};

/// Errors from a [`JobStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A domain rule was violated (validation, authorization, state).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The backing database failed or is unreachable.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// The domain error, if this is not a storage failure.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            StoreError::Core(e) => Some(e),
            StoreError::Database(_) => None,
        }
    }

    /// True when the error comes from the job state machine.
    pub fn is_state_error(&self) -> bool {
        self.as_core().is_some_and(CoreError::is_state_error)
    }
}

/// Field updates that accompany a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Required when moving to PROCESSING.
    pub backend_id: Option<String>,
    /// Required when moving to PROCESSING.
    pub backend_prompt_id: Option<String>,
    /// Recorded on the job when set; cleared on PROCESSING.
    pub error: Option<String>,
    /// Backend outputs, recorded on COMPLETED.
    pub result: Option<serde_json::Value>,
    /// Count this transition as a submission attempt.
    pub count_attempt: bool,
}

impl TransitionFields {
    /// Fields for a successful submission to `backend_id`.
    pub fn assigned(backend_id: impl Into<String>, backend_prompt_id: impl Into<String>) -> Self {
        Self {
            backend_id: Some(backend_id.into()),
            backend_prompt_id: Some(backend_prompt_id.into()),
            count_attempt: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn completed(result: Option<serde_json::Value>) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }
}

/// Authoritative job bookkeeping.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a PENDING job. Fails with a validation error on an empty or
    /// malformed prompt.
    async fn enqueue(
        &self,
        user_id: Option<DbId>,
        prompt: &serde_json::Value,
    ) -> Result<Job, StoreError>;

    /// Create a new PENDING job from a FAILED job's prompt.
    ///
    /// The new job's `retry_of_job_id` points to the original.
    async fn retry(
        &self,
        job_id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError>;

    /// Apply a status change plus its field updates, rejecting any edge
    /// that is not part of the state machine.
    async fn transition(
        &self,
        id: DbId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, StoreError>;

    /// Count a failed dispatch attempt on a PENDING job, optionally
    /// recording why it failed.
    async fn record_attempt(&self, id: DbId, error: Option<&str>) -> Result<Job, StoreError>;

    /// Cancel a non-terminal job owned by `requester_id` (or any job when
    /// `is_admin`). Returns the record as it was just before cancellation.
    async fn cancel(
        &self,
        id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError>;

    /// PENDING jobs, oldest first (ties broken by id).
    async fn list_pending(&self) -> Result<Vec<Job>, StoreError>;

    /// PROCESSING jobs, oldest first.
    async fn list_processing(&self) -> Result<Vec<Job>, StoreError>;

    /// A user's jobs, newest first.
    async fn list_by_user(
        &self,
        user_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError>;

    /// All jobs (admin view), newest first.
    async fn list_all(&self, params: &JobListQuery) -> Result<Vec<Job>, StoreError>;

    /// Counts by status.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}

// ---------------------------------------------------------------------------
// Shared rules
// ---------------------------------------------------------------------------

/// Allow the owner of a job or an admin. Anonymous jobs can only be
/// managed by admins.
pub fn authorize(
    job: &Job,
    requester_id: Option<DbId>,
    is_admin: bool,
    action: &str,
) -> Result<(), CoreError> {
    if is_admin {
        return Ok(());
    }
    match (job.user_id, requester_id) {
        (Some(owner), Some(requester)) if owner == requester => Ok(()),
        _ => Err(CoreError::Forbidden(format!(
            "Cannot {action} another user's job"
        ))),
    }
}

/// Check the field requirements of a transition target.
pub fn validate_fields(to: JobStatus, fields: &TransitionFields) -> Result<(), CoreError> {
    if to == JobStatus::Processing {
        let missing = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
        if missing(&fields.backend_id) || missing(&fields.backend_prompt_id) {
            return Err(CoreError::Validation(
                "A processing job needs a backend id and a backend prompt id".to_string(),
            ));
        }
    }
    Ok(())
}

/// Apply an already-validated transition to an in-memory record.
pub fn apply_transition(job: &mut Job, to: JobStatus, fields: TransitionFields, now: Timestamp) {
    job.status = to;
    job.updated_at = now;
    if fields.count_attempt {
        job.attempts += 1;
    }
    match to {
        JobStatus::Processing => {
            job.backend_id = fields.backend_id;
            job.backend_prompt_id = fields.backend_prompt_id;
            job.error = None;
            job.started_at = Some(now);
        }
        JobStatus::Cancelled => {
            job.backend_id = None;
            job.backend_prompt_id = None;
            job.completed_at = Some(now);
        }
        JobStatus::Completed | JobStatus::Failed => {
            if fields.error.is_some() {
                job.error = fields.error;
            }
            if fields.result.is_some() {
                job.result = fields.result;
            }
            job.completed_at = Some(now);
        }
        JobStatus::Pending => {}
    }
}

/// 00:00 UTC of the day containing `now`.
pub fn start_of_day(now: Timestamp) -> Timestamp {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}
