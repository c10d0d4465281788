//! PostgreSQL implementation of [`JobStore`] over the `jobs` table.
//!
//! Every mutation runs in a transaction that first locks the row with
//! `SELECT ... FOR UPDATE`, so concurrent writers on one job serialize
//! and the state machine check always sees the committed status.

use async_trait::async_trait;
use chrono::Utc;
use genorch_core::error::CoreError;
use genorch_core::job_status::{JobStatus, StatusId};
use genorch_core::prompt::validate_prompt;
use genorch_core::types::DbId;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::job::{Job, JobListQuery, JobStats};
use crate::store::{authorize, start_of_day, validate_fields, JobStore, StoreError, TransitionFields};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, user_id, prompt, status_id, backend_id, backend_prompt_id, \
    error_message, attempts, result, retry_of_job_id, \
    created_at, updated_at, started_at, completed_at";

/// Job store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock a job row for the rest of the transaction.
    async fn lock(tx: &mut Transaction<'_, Postgres>, id: DbId) -> Result<Job, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::Core(CoreError::NotFound { entity: "Job", id }))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status_id = $1 ORDER BY created_at ASC, id ASC"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(status.id())
            .fetch_all(&self.pool)
            .await?)
    }

    /// Shared listing query builder. When `user_id` is `Some`, filters to
    /// that user's jobs; when `None`, returns all jobs (admin view).
    async fn list_jobs(
        &self,
        user_id: Option<DbId>,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        let (limit, offset) = params.page();

        // Build the WHERE clause and track the next bind parameter index.
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if user_id.is_some() {
            conditions.push(format!("user_id = ${bind_idx}"));
            bind_idx += 1;
        }

        if params.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, Job>(&query);

        if let Some(uid) = user_id {
            q = q.bind(uid);
        }
        if let Some(status) = params.status {
            q = q.bind(status.id());
        }

        q = q.bind(limit).bind(offset);

        Ok(q.fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(
        &self,
        user_id: Option<DbId>,
        prompt: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        validate_prompt(prompt)?;

        let query = format!(
            "INSERT INTO jobs (user_id, prompt, status_id) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(user_id)
            .bind(prompt)
            .bind(JobStatus::Pending.id())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn retry(
        &self,
        job_id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        let original = self
            .find_by_id(job_id)
            .await?
            .ok_or(CoreError::NotFound { entity: "Job", id: job_id })?;

        authorize(&original, requester_id, is_admin, "retry")?;

        if original.status != JobStatus::Failed {
            return Err(CoreError::Validation("Only failed jobs can be retried".into()).into());
        }

        let query = format!(
            "INSERT INTO jobs (user_id, prompt, status_id, retry_of_job_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(original.user_id)
            .bind(&original.prompt)
            .bind(JobStatus::Pending.id())
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn transition(
        &self,
        id: DbId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, StoreError> {
        validate_fields(to, &fields)?;

        let mut tx = self.pool.begin().await?;
        let current = Self::lock(&mut tx, id).await?;
        current.status.check_transition(to)?;

        let processing = JobStatus::Processing.id();
        let cancelled = JobStatus::Cancelled.id();
        let query = format!(
            "UPDATE jobs SET \
                 status_id = $2, \
                 backend_id = CASE WHEN $2 = {processing} THEN $3::TEXT \
                                   WHEN $2 = {cancelled} THEN NULL ELSE backend_id END, \
                 backend_prompt_id = CASE WHEN $2 = {processing} THEN $4::TEXT \
                                          WHEN $2 = {cancelled} THEN NULL ELSE backend_prompt_id END, \
                 error_message = CASE WHEN $2 = {processing} THEN NULL \
                                      ELSE COALESCE($5::TEXT, error_message) END, \
                 result = COALESCE($6::JSONB, result), \
                 attempts = attempts + $7, \
                 started_at = CASE WHEN $2 = {processing} THEN NOW() ELSE started_at END, \
                 completed_at = CASE WHEN $2 = {processing} THEN completed_at ELSE NOW() END, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(to.id())
            .bind(fields.backend_id)
            .bind(fields.backend_prompt_id)
            .bind(fields.error)
            .bind(fields.result)
            .bind(i32::from(fields.count_attempt))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn record_attempt(&self, id: DbId, error: Option<&str>) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock(&mut tx, id).await?;
        if current.status != JobStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: current.status,
                to: JobStatus::Pending,
            }
            .into());
        }

        let query = format!(
            "UPDATE jobs \
             SET attempts = attempts + 1, \
                 error_message = COALESCE($2, error_message), \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(error)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn cancel(
        &self,
        id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock(&mut tx, id).await?;
        authorize(&current, requester_id, is_admin, "cancel")?;
        if current.status.is_terminal() {
            return Err(CoreError::AlreadyTerminal {
                id,
                status: current.status,
            }
            .into());
        }

        sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, backend_id = NULL, backend_prompt_id = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(current)
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        self.list_by_status(JobStatus::Pending).await
    }

    async fn list_processing(&self) -> Result<Vec<Job>, StoreError> {
        self.list_by_status(JobStatus::Processing).await
    }

    async fn list_by_user(
        &self,
        user_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        self.list_jobs(Some(user_id), params).await
    }

    async fn list_all(&self, params: &JobListQuery) -> Result<Vec<Job>, StoreError> {
        self.list_jobs(None, params).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let ids: [StatusId; 5] = JobStatus::ALL.map(JobStatus::id);
        Ok(sqlx::query_as::<_, JobStats>(
            "SELECT \
                 COUNT(*) FILTER (WHERE status_id = $1) AS pending, \
                 COUNT(*) FILTER (WHERE status_id = $2) AS processing, \
                 COUNT(*) FILTER (WHERE status_id = $3 AND completed_at >= $6) AS completed_today, \
                 COUNT(*) FILTER (WHERE status_id = $4) AS failed, \
                 COUNT(*) FILTER (WHERE status_id = $5) AS cancelled, \
                 COUNT(*) AS total \
             FROM jobs",
        )
        .bind(ids[0])
        .bind(ids[1])
        .bind(ids[2])
        .bind(ids[3])
        .bind(ids[4])
        .bind(start_of_day(Utc::now()))
        .fetch_one(&self.pool)
        .await?)
    }
}
