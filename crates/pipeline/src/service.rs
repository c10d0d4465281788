//! Inbound operations on jobs and backends.
//!
//! [`JobService`] is what the HTTP layer talks to. It combines the job
//! store, the server pool and the queue monitor so handlers stay thin.

use std::sync::Arc;

use genorch_comfyui::messages::Capabilities;
use genorch_comfyui::pool::{BackendSnapshot, ServerPool};
use genorch_comfyui::retry::CallContext;
use genorch_core::error::CoreError;
use genorch_core::job_status::JobStatus;
use genorch_core::types::DbId;
use genorch_db::models::job::{Job, JobListQuery, JobStats};
use genorch_db::JobStore;

use crate::error::PipelineError;
use crate::monitor::QueueMonitor;
use crate::status::{queue_position, JobStatusView};

/// Who is asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requester {
    pub user_id: Option<DbId>,
    pub is_admin: bool,
}

impl Requester {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: DbId) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: false,
        }
    }

    pub fn admin(user_id: Option<DbId>) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    /// Admins see everything; anonymous jobs are visible to anyone;
    /// otherwise only the owner.
    fn can_view(&self, job: &Job) -> bool {
        self.is_admin || job.user_id.is_none() || job.user_id == self.user_id
    }
}

/// Façade over the store, pool and monitor.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    pool: Arc<ServerPool>,
    monitor: Arc<QueueMonitor>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, monitor: Arc<QueueMonitor>) -> Self {
        Self {
            pool: Arc::clone(monitor.pool()),
            store,
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // ---- jobs ----

    /// Create a PENDING job and nudge the monitor.
    pub async fn enqueue(
        &self,
        requester: Requester,
        prompt: &serde_json::Value,
    ) -> Result<Job, PipelineError> {
        let job = self.store.enqueue(requester.user_id, prompt).await?;
        tracing::info!(job_id = job.id, user_id = ?job.user_id, "Job enqueued");
        self.monitor.wake();
        Ok(job)
    }

    /// Cancel a job and return its CANCELLED record.
    ///
    /// A job that was already PROCESSING is also withdrawn from its
    /// backend, best effort.
    pub async fn cancel(&self, job_id: DbId, requester: Requester) -> Result<Job, PipelineError> {
        let previous = self
            .store
            .cancel(job_id, requester.user_id, requester.is_admin)
            .await?;
        tracing::info!(job_id, from = %previous.status, "Job cancelled");

        if previous.status == JobStatus::Processing {
            self.withdraw_from_backend(&previous).await;
        }

        self.find(job_id).await
    }

    /// Re-enqueue a FAILED job's prompt as a new job.
    pub async fn retry(&self, job_id: DbId, requester: Requester) -> Result<Job, PipelineError> {
        let job = self
            .store
            .retry(job_id, requester.user_id, requester.is_admin)
            .await?;
        tracing::info!(job_id = job.id, retry_of = job_id, "Job retried");
        self.monitor.wake();
        Ok(job)
    }

    pub async fn get_status(
        &self,
        job_id: DbId,
        requester: Requester,
    ) -> Result<JobStatusView, PipelineError> {
        let job = self.find(job_id).await?;
        if !requester.can_view(&job) {
            return Err(CoreError::Forbidden("Cannot view another user's job".into()).into());
        }

        let position = if job.status == JobStatus::Pending {
            queue_position(&self.store.list_pending().await?, job.id)
        } else {
            None
        };
        Ok(JobStatusView::new(job, position))
    }

    /// The requester's own jobs, or every job for admins.
    pub async fn list(
        &self,
        requester: Requester,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = match (requester.is_admin, requester.user_id) {
            (true, _) => self.store.list_all(params).await?,
            (false, Some(user_id)) => self.store.list_by_user(user_id, params).await?,
            (false, None) => {
                return Err(
                    CoreError::Forbidden("Listing jobs requires a user identity".into()).into(),
                )
            }
        };
        Ok(jobs)
    }

    pub async fn stats(&self) -> Result<JobStats, PipelineError> {
        Ok(self.store.stats().await?)
    }

    // ---- backends ----

    pub async fn backends(&self) -> Vec<BackendSnapshot> {
        self.pool.snapshot().await
    }

    /// Run a health check now and return the fresh table.
    pub async fn check_backends(&self) -> Vec<BackendSnapshot> {
        self.pool.check_health().await;
        self.pool.snapshot().await
    }

    pub async fn capabilities(&self, backend_id: &str) -> Result<Capabilities, PipelineError> {
        let api = self
            .pool
            .api(backend_id)
            .ok_or_else(|| PipelineError::UnknownBackend(backend_id.to_string()))?;

        let ctx = CallContext::with_timeout(self.monitor.settings().call_deadline);
        api.capabilities(&ctx)
            .await
            .map_err(|source| PipelineError::Backend {
                backend_id: backend_id.to_string(),
                source,
            })
    }

    // ---- private helpers ----

    async fn find(&self, job_id: DbId) -> Result<Job, PipelineError> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound { entity: "Job", id: job_id }.into())
    }

    async fn withdraw_from_backend(&self, job: &Job) {
        let (Some(backend_id), Some(prompt_id)) =
            (job.backend_id.as_deref(), job.backend_prompt_id.as_deref())
        else {
            return;
        };
        let Some(api) = self.pool.api(backend_id) else {
            return;
        };

        // The job is already CANCELLED in the store; withdrawal is best
        // effort and must not outlast the request.
        let ctx = CallContext::with_timeout(self.monitor.settings().probe_timeout);
        match api.cancel_prompt(&ctx, prompt_id).await {
            Ok(()) => tracing::info!(job_id = job.id, backend_id, prompt_id, "Prompt withdrawn from backend"),
            Err(e) => tracing::warn!(
                job_id = job.id,
                backend_id,
                prompt_id,
                error = %e,
                "Failed to withdraw prompt from backend",
            ),
        }
    }
}
