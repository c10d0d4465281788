//! In-process [`JobStore`] for deployments without PostgreSQL.
//!
//! A single async mutex guards the whole table, which trivially gives
//! per-job mutual exclusion. Records live for the lifetime of the
//! process only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use genorch_core::error::CoreError;
use genorch_core::job_status::JobStatus;
use genorch_core::prompt::validate_prompt;
use genorch_core::types::DbId;
use tokio::sync::Mutex;

use crate::models::job::{Job, JobListQuery, JobStats};
use crate::store::{
    apply_transition, authorize, start_of_day, validate_fields, JobStore, StoreError,
    TransitionFields,
};

#[derive(Default)]
struct Table {
    last_id: DbId,
    jobs: BTreeMap<DbId, Job>,
}

impl Table {
    fn insert(
        &mut self,
        user_id: Option<DbId>,
        prompt: serde_json::Value,
        retry_of_job_id: Option<DbId>,
    ) -> Job {
        self.last_id += 1;
        let now = Utc::now();
        let job = Job {
            id: self.last_id,
            user_id,
            prompt,
            status: JobStatus::Pending,
            backend_id: None,
            backend_prompt_id: None,
            error: None,
            attempts: 0,
            result: None,
            retry_of_job_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn get_mut(&mut self, id: DbId) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(&id)
            .ok_or(StoreError::Core(CoreError::NotFound { entity: "Job", id }))
    }

    fn fifo(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    fn page<'a>(&self, jobs: impl Iterator<Item = &'a Job>, params: &JobListQuery) -> Vec<Job> {
        let (limit, offset) = params.page();
        let mut matching: Vec<&Job> = jobs
            .filter(|j| params.status.map_or(true, |s| j.status == s))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect()
    }
}

/// Job store held entirely in memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    table: Mutex<Table>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        user_id: Option<DbId>,
        prompt: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        validate_prompt(prompt)?;
        Ok(self.table.lock().await.insert(user_id, prompt.clone(), None))
    }

    async fn retry(
        &self,
        job_id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let original = table.get_mut(job_id)?.clone();

        authorize(&original, requester_id, is_admin, "retry")?;

        if original.status != JobStatus::Failed {
            return Err(CoreError::Validation("Only failed jobs can be retried".into()).into());
        }

        Ok(table.insert(original.user_id, original.prompt, Some(job_id)))
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().await.jobs.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: DbId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, StoreError> {
        validate_fields(to, &fields)?;

        let mut table = self.table.lock().await;
        let job = table.get_mut(id)?;
        job.status.check_transition(to)?;
        apply_transition(job, to, fields, Utc::now());
        Ok(job.clone())
    }

    async fn record_attempt(&self, id: DbId, error: Option<&str>) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let job = table.get_mut(id)?;
        if job.status != JobStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            }
            .into());
        }

        job.attempts += 1;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn cancel(
        &self,
        id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        let job = table.get_mut(id)?;
        authorize(job, requester_id, is_admin, "cancel")?;
        if job.status.is_terminal() {
            return Err(CoreError::AlreadyTerminal {
                id,
                status: job.status,
            }
            .into());
        }

        let previous = job.clone();
        apply_transition(
            job,
            JobStatus::Cancelled,
            TransitionFields::default(),
            Utc::now(),
        );
        Ok(previous)
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().await.fifo(JobStatus::Pending))
    }

    async fn list_processing(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().await.fifo(JobStatus::Processing))
    }

    async fn list_by_user(
        &self,
        user_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.page(
            table.jobs.values().filter(|j| j.user_id == Some(user_id)),
            params,
        ))
    }

    async fn list_all(&self, params: &JobListQuery) -> Result<Vec<Job>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.page(table.jobs.values(), params))
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let today = start_of_day(Utc::now());
        let table = self.table.lock().await;

        let mut stats = JobStats {
            total: table.jobs.len() as i64,
            ..Default::default()
        };
        for job in table.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    if job.completed_at.is_some_and(|at| at >= today) {
                        stats.completed_today += 1;
                    }
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}
