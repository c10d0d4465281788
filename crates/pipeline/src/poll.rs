//! PROCESSING → COMPLETED | FAILED.
//!
//! Jobs are grouped by backend and the groups are polled concurrently, so
//! each backend's queue is read once per tick and a slow backend only
//! delays its own jobs. Every read is bounded by the probe timeout, and a
//! backend the health loop already marked unhealthy is not contacted at
//! all. A prompt that has left the queue is resolved through the
//! backend's history. A job whose backend cannot be reached, or whose
//! history cannot be read, stays PROCESSING until `stuck_grace` has
//! passed, then fails.

use std::collections::{BTreeMap, HashSet};

use futures::future::join_all;
use genorch_comfyui::api::ComfyUIApi;
use genorch_comfyui::messages::PromptOutcome;
use genorch_core::backend::BackendHealth;
use genorch_core::job_status::JobStatus;
use genorch_db::models::job::Job;
use genorch_db::TransitionFields;
use tokio::time::Instant;

use crate::error::PipelineError;
use crate::monitor::MonitorContext;

#[derive(Debug, Default)]
pub(crate) struct PollReport {
    pub completed: usize,
    pub failed: usize,
}

pub(crate) async fn poll_processing(ctx: &MonitorContext) -> Result<PollReport, PipelineError> {
    let jobs = ctx.store.list_processing().await?;

    {
        let live: HashSet<_> = jobs.iter().map(|j| j.id).collect();
        ctx.unreachable_since
            .lock()
            .await
            .retain(|id, _| live.contains(id));
    }

    let mut by_backend: BTreeMap<&str, Vec<&Job>> = BTreeMap::new();
    for job in &jobs {
        if let Some(backend_id) = job.backend_id.as_deref() {
            by_backend.entry(backend_id).or_default().push(job);
        }
    }

    let results = join_all(
        by_backend
            .into_iter()
            .map(|(backend_id, jobs)| poll_backend(ctx, backend_id, jobs)),
    )
    .await;

    let mut report = PollReport::default();
    for result in results {
        let polled = result?;
        report.completed += polled.completed;
        report.failed += polled.failed;
    }
    Ok(report)
}

/// Poll every job assigned to one backend.
async fn poll_backend(
    ctx: &MonitorContext,
    backend_id: &str,
    jobs: Vec<&Job>,
) -> Result<PollReport, PipelineError> {
    let mut report = PollReport::default();

    let Some(api) = ctx.pool.api(backend_id) else {
        for job in jobs {
            let message = format!("Assigned backend \"{backend_id}\" is no longer configured");
            finish(ctx, job, JobStatus::Failed, TransitionFields::failed(message), &mut report)
                .await?;
        }
        return Ok(report);
    };

    let unreachable = format!("Backend \"{backend_id}\" unreachable");
    let known_down = ctx
        .pool
        .status(backend_id)
        .await
        .is_some_and(|s| s.health == BackendHealth::Unhealthy);
    if known_down {
        for job in jobs {
            check_stuck(ctx, job, &unreachable, &mut report).await?;
        }
        return Ok(report);
    }

    match api.queue(&ctx.probe_context()).await {
        Ok(queue) => {
            for job in jobs {
                let Some(prompt_id) = job.backend_prompt_id.as_deref() else {
                    continue;
                };
                if queue.contains(prompt_id) {
                    ctx.unreachable_since.lock().await.remove(&job.id);
                } else {
                    resolve(ctx, backend_id, api, job, prompt_id, &mut report).await?;
                }
            }
        }
        Err(e) => {
            tracing::warn!(backend_id, error = %e, "Backend queue unreachable while polling");
            for job in jobs {
                check_stuck(ctx, job, &unreachable, &mut report).await?;
            }
        }
    }
    Ok(report)
}

/// Read the history of a prompt that left the queue and settle the job.
async fn resolve(
    ctx: &MonitorContext,
    backend_id: &str,
    api: &ComfyUIApi,
    job: &Job,
    prompt_id: &str,
    report: &mut PollReport,
) -> Result<(), PipelineError> {
    let outcome = match api.history(&ctx.probe_context(), prompt_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(job_id = job.id, prompt_id, error = %e, "History lookup failed");
            let reason = format!("History of prompt {prompt_id} on backend \"{backend_id}\" unavailable");
            return check_stuck(ctx, job, &reason, report).await;
        }
    };

    let (to, fields) = match outcome {
        PromptOutcome::Success { outputs } => (
            JobStatus::Completed,
            TransitionFields::completed(Some(outputs)),
        ),
        PromptOutcome::Error { message } => (JobStatus::Failed, TransitionFields::failed(message)),
        PromptOutcome::Unknown => (
            JobStatus::Failed,
            TransitionFields::failed(format!("Backend lost track of prompt {prompt_id}")),
        ),
    };
    finish(ctx, job, to, fields, report).await
}

/// Start or advance the job's outage clock; fail it once the grace is spent.
async fn check_stuck(
    ctx: &MonitorContext,
    job: &Job,
    reason: &str,
    report: &mut PollReport,
) -> Result<(), PipelineError> {
    let since = *ctx
        .unreachable_since
        .lock()
        .await
        .entry(job.id)
        .or_insert_with(Instant::now);

    let elapsed = since.elapsed();
    if elapsed < ctx.settings.stuck_grace {
        return Ok(());
    }

    let message = format!("{reason} for {}s", elapsed.as_secs());
    finish(ctx, job, JobStatus::Failed, TransitionFields::failed(message), report).await
}

/// Apply a terminal transition, tolerating a concurrent cancel.
async fn finish(
    ctx: &MonitorContext,
    job: &Job,
    to: JobStatus,
    fields: TransitionFields,
    report: &mut PollReport,
) -> Result<(), PipelineError> {
    let error = fields.error.clone();
    match ctx.store.transition(job.id, to, fields).await {
        Ok(_) => {
            ctx.unreachable_since.lock().await.remove(&job.id);
            match to {
                JobStatus::Completed => {
                    report.completed += 1;
                    tracing::info!(job_id = job.id, backend_id = ?job.backend_id, "Job completed");
                }
                _ => {
                    report.failed += 1;
                    tracing::info!(
                        job_id = job.id,
                        backend_id = ?job.backend_id,
                        error = error.as_deref().unwrap_or(""),
                        "Job failed",
                    );
                }
            }
            Ok(())
        }
        Err(e) if e.is_state_error() => {
            tracing::debug!(job_id = job.id, error = %e, "Job settled concurrently");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
