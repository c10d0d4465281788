//! PENDING → PROCESSING.
//!
//! A backend that fails a submission with a transport error, 5xx or 429
//! sits out the rest of the cycle. A definitive refusal (4xx, malformed
//! reply) only rules that backend out for the job it refused, and the job
//! moves on to the next candidate.

use std::collections::HashSet;

use genorch_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use genorch_comfyui::messages::SubmitResponse;
use genorch_core::job_status::JobStatus;
use genorch_core::types::DbId;
use genorch_db::models::job::Job;
use genorch_db::TransitionFields;

use crate::error::PipelineError;
use crate::monitor::MonitorContext;

enum Dispatch {
    Submitted,
    /// No capacity or a backend failed; later jobs wait for the next tick
    /// so FIFO order holds.
    Deferred,
    /// Every backend tried refused this job outright. The job itself is the
    /// problem, so later jobs may go ahead.
    Refused,
    /// The job changed under us (usually cancelled).
    Skipped,
}

/// Submit up to `max_dispatch_per_tick` PENDING jobs, oldest first.
///
/// Returns the number of jobs moved to PROCESSING. Only store failures
/// are returned as errors.
pub(crate) async fn dispatch_pending(ctx: &MonitorContext) -> Result<usize, PipelineError> {
    let pending = ctx.store.list_pending().await?;
    let mut failing = HashSet::new();
    let mut dispatched = 0;

    for job in pending.iter().take(ctx.settings.max_dispatch_per_tick) {
        match dispatch_one(ctx, job, &mut failing).await? {
            Dispatch::Submitted => dispatched += 1,
            Dispatch::Refused | Dispatch::Skipped => continue,
            Dispatch::Deferred => break,
        }
    }

    Ok(dispatched)
}

/// Try candidates in selection order until one accepts the job.
///
/// `failing` collects backends that failed for reasons of their own during
/// this cycle; they are not offered to later jobs either.
async fn dispatch_one(
    ctx: &MonitorContext,
    job: &Job,
    failing: &mut HashSet<String>,
) -> Result<Dispatch, PipelineError> {
    let mut refused_by = HashSet::new();
    let mut tried_any = false;
    let mut backend_failed = false;

    let (backend_id, api, submitted) = loop {
        let backend = ctx
            .pool
            .select_best_fresh_where(|b| !failing.contains(&b.id) && !refused_by.contains(&b.id))
            .await;
        let Some((backend_id, api)) =
            backend.and_then(|b| ctx.pool.api(&b.id).map(|api| (b.id, api)))
        else {
            let only_refusals = !backend_failed && !refused_by.is_empty();
            return out_of_candidates(ctx, job, tried_any, only_refusals).await;
        };

        tried_any = true;
        match api.submit_prompt(&ctx.call_context(), &job.prompt).await {
            Ok(submitted) => break (backend_id, api, submitted),
            Err(source) => {
                let definitive = is_refusal(&source);
                let err = PipelineError::Submission {
                    backend_id: backend_id.clone(),
                    source,
                };
                tracing::warn!(job_id = job.id, %backend_id, error = %err, "Dispatch failed");
                let recorded = record_attempt(ctx, job.id, Some(&err.to_string())).await?;
                if let Dispatch::Skipped = recorded {
                    return Ok(Dispatch::Skipped);
                }
                if definitive {
                    refused_by.insert(backend_id);
                } else {
                    backend_failed = true;
                    failing.insert(backend_id);
                }
            }
        }
    };

    assign(ctx, job, &backend_id, api, submitted).await
}

/// No eligible backend is left for `job`.
async fn out_of_candidates(
    ctx: &MonitorContext,
    job: &Job,
    tried_any: bool,
    only_refusals: bool,
) -> Result<Dispatch, PipelineError> {
    if !tried_any {
        tracing::info!(
            job_id = job.id,
            attempts = job.attempts + 1,
            "{}; job stays pending",
            PipelineError::BackendUnavailable,
        );
        return record_attempt(ctx, job.id, None).await;
    }
    if only_refusals {
        tracing::info!(job_id = job.id, "Every available backend refused the job");
        return Ok(Dispatch::Refused);
    }
    Ok(Dispatch::Deferred)
}

async fn assign(
    ctx: &MonitorContext,
    job: &Job,
    backend_id: &str,
    api: &ComfyUIApi,
    submitted: SubmitResponse,
) -> Result<Dispatch, PipelineError> {
    let assigned = ctx
        .store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned(backend_id, &submitted.prompt_id),
        )
        .await;

    match assigned {
        Ok(_) => {
            ctx.pool.note_dispatched(backend_id).await;
            tracing::info!(
                job_id = job.id,
                backend_id,
                prompt_id = %submitted.prompt_id,
                "Job dispatched",
            );
            Ok(Dispatch::Submitted)
        }
        Err(e) => {
            // The prompt is running on the backend but the job will never
            // track it.
            withdraw(ctx, api, job.id, &submitted.prompt_id).await;
            if e.is_state_error() {
                tracing::info!(job_id = job.id, error = %e, "Job changed during dispatch");
                Ok(Dispatch::Skipped)
            } else {
                Err(e.into())
            }
        }
    }
}

/// The backend answered and said no to this particular job.
fn is_refusal(err: &ComfyUIApiError) -> bool {
    !err.is_retryable() && !matches!(err, ComfyUIApiError::DeadlineExceeded)
}

/// Count a failed dispatch on a job that should still be PENDING.
async fn record_attempt(
    ctx: &MonitorContext,
    job_id: DbId,
    error: Option<&str>,
) -> Result<Dispatch, PipelineError> {
    match ctx.store.record_attempt(job_id, error).await {
        Ok(_) => Ok(Dispatch::Deferred),
        Err(e) if e.is_state_error() => Ok(Dispatch::Skipped),
        Err(e) => Err(e.into()),
    }
}

async fn withdraw(ctx: &MonitorContext, api: &ComfyUIApi, job_id: DbId, prompt_id: &str) {
    if let Err(e) = api.cancel_prompt(&ctx.call_context(), prompt_id).await {
        tracing::warn!(job_id, prompt_id, error = %e, "Failed to withdraw orphaned prompt");
    }
}
