//! Store contract checks shared by the in-memory and PostgreSQL suites.
//!
//! Each function drives a fresh store through one behaviour and panics
//! on violation.

#![allow(dead_code)]

use std::sync::Arc;

use assert_matches::assert_matches;
use genorch_core::error::CoreError;
use genorch_core::job_status::JobStatus;
use genorch_db::models::job::JobListQuery;
use genorch_db::{JobStore, StoreError, TransitionFields};
use serde_json::json;

pub async fn enqueue_creates_pending_job(store: &dyn JobStore) {
    let job = store.enqueue(Some(7), &json!("cat")).await.unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.user_id, Some(7));
    assert_eq!(job.attempts, 0);
    assert!(job.backend_id.is_none());
    assert!(job.backend_prompt_id.is_none());

    let found = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(found.prompt, json!("cat"));
}

pub async fn enqueue_rejects_empty_prompt(store: &dyn JobStore) {
    let err = store.enqueue(None, &json!("  ")).await.unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::Validation(_)));
    assert_eq!(store.stats().await.unwrap().total, 0);
}

pub async fn happy_path_transitions(store: &dyn JobStore) {
    let job = store.enqueue(None, &json!("cat")).await.unwrap();

    let processing = store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned("local", "prompt-1"),
        )
        .await
        .unwrap();
    assert_eq!(processing.status, JobStatus::Processing);
    assert_eq!(processing.backend_id.as_deref(), Some("local"));
    assert_eq!(processing.backend_prompt_id.as_deref(), Some("prompt-1"));
    assert_eq!(processing.attempts, 1);
    assert!(processing.started_at.is_some());

    let completed = store
        .transition(
            job.id,
            JobStatus::Completed,
            TransitionFields::completed(Some(json!({ "9": { "images": [] } }))),
        )
        .await
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.backend_id.as_deref(), Some("local"));
    assert!(completed.result.is_some());
    assert!(completed.completed_at.is_some());
}

pub async fn illegal_transitions_rejected(store: &dyn JobStore) {
    let job = store.enqueue(None, &json!("cat")).await.unwrap();

    let err = store
        .transition(job.id, JobStatus::Completed, TransitionFields::default())
        .await
        .unwrap_err();
    assert_matches!(
        err,
        StoreError::Core(CoreError::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Completed
        })
    );

    store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned("local", "p"),
        )
        .await
        .unwrap();
    store
        .transition(job.id, JobStatus::Completed, TransitionFields::default())
        .await
        .unwrap();

    let err = store
        .transition(job.id, JobStatus::Pending, TransitionFields::default())
        .await
        .unwrap_err();
    assert!(err.is_state_error());

    let unchanged = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Completed);
}

pub async fn processing_requires_backend_fields(store: &dyn JobStore) {
    let job = store.enqueue(None, &json!("cat")).await.unwrap();

    let err = store
        .transition(job.id, JobStatus::Processing, TransitionFields::default())
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::Validation(_)));

    let still = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(still.status, JobStatus::Pending);
}

pub async fn transition_unknown_job_is_not_found(store: &dyn JobStore) {
    let err = store
        .transition(999, JobStatus::Cancelled, TransitionFields::default())
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::NotFound { id: 999, .. }));
}

pub async fn record_attempt_counts_and_keeps_pending(store: &dyn JobStore) {
    let job = store.enqueue(None, &json!("cat")).await.unwrap();

    store.record_attempt(job.id, None).await.unwrap();
    let after = store
        .record_attempt(job.id, Some("backend-2 refused"))
        .await
        .unwrap();

    assert_eq!(after.status, JobStatus::Pending);
    assert_eq!(after.attempts, 2);
    assert_eq!(after.error.as_deref(), Some("backend-2 refused"));
}

pub async fn cancel_pending_by_owner(store: &dyn JobStore) {
    let job = store.enqueue(Some(1), &json!("cat")).await.unwrap();

    let previous = store.cancel(job.id, Some(1), false).await.unwrap();
    assert_eq!(previous.status, JobStatus::Pending);

    let cancelled = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(store.list_pending().await.unwrap().is_empty());
}

pub async fn cancel_processing_clears_assignment(store: &dyn JobStore) {
    let job = store.enqueue(Some(1), &json!("cat")).await.unwrap();
    store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned("remote-1", "abc"),
        )
        .await
        .unwrap();

    let previous = store.cancel(job.id, None, true).await.unwrap();
    assert_eq!(previous.status, JobStatus::Processing);
    assert_eq!(previous.backend_prompt_id.as_deref(), Some("abc"));

    let cancelled = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.backend_id.is_none());
    assert!(cancelled.backend_prompt_id.is_none());
}

pub async fn cancel_by_stranger_forbidden(store: &dyn JobStore) {
    let owned = store.enqueue(Some(1), &json!("cat")).await.unwrap();
    let anonymous = store.enqueue(None, &json!("dog")).await.unwrap();

    let err = store.cancel(owned.id, Some(2), false).await.unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::Forbidden(_)));

    let err = store.cancel(anonymous.id, None, false).await.unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::Forbidden(_)));

    let job = store.find_by_id(owned.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

pub async fn cancel_completed_is_state_error(store: &dyn JobStore) {
    let job = store.enqueue(Some(1), &json!("cat")).await.unwrap();
    store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned("local", "p"),
        )
        .await
        .unwrap();
    store
        .transition(job.id, JobStatus::Completed, TransitionFields::default())
        .await
        .unwrap();

    let err = store.cancel(job.id, Some(1), false).await.unwrap_err();
    assert_matches!(
        err,
        StoreError::Core(CoreError::AlreadyTerminal {
            status: JobStatus::Completed,
            ..
        })
    );
}

pub async fn list_pending_is_fifo(store: &dyn JobStore) {
    let first = store.enqueue(None, &json!("1")).await.unwrap();
    let second = store.enqueue(None, &json!("2")).await.unwrap();
    let third = store.enqueue(None, &json!("3")).await.unwrap();
    store
        .transition(
            second.id,
            JobStatus::Processing,
            TransitionFields::assigned("local", "p"),
        )
        .await
        .unwrap();

    let pending: Vec<_> = store
        .list_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(pending, vec![first.id, third.id]);

    let processing = store.list_processing().await.unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, second.id);
}

pub async fn list_by_user_and_status_filter(store: &dyn JobStore) {
    store.enqueue(Some(1), &json!("a")).await.unwrap();
    let b = store.enqueue(Some(1), &json!("b")).await.unwrap();
    store.enqueue(Some(2), &json!("c")).await.unwrap();
    store.cancel(b.id, Some(1), false).await.unwrap();

    let mine = store
        .list_by_user(1, &JobListQuery::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|j| j.user_id == Some(1)));

    let cancelled = store
        .list_all(&JobListQuery {
            status: Some(JobStatus::Cancelled),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, b.id);
}

pub async fn stats_count_by_status(store: &dyn JobStore) {
    let a = store.enqueue(Some(1), &json!("a")).await.unwrap();
    let b = store.enqueue(Some(1), &json!("b")).await.unwrap();
    let c = store.enqueue(Some(1), &json!("c")).await.unwrap();
    store.enqueue(Some(1), &json!("d")).await.unwrap();

    for (job, prompt_id) in [(&a, "pa"), (&b, "pb")] {
        store
            .transition(
                job.id,
                JobStatus::Processing,
                TransitionFields::assigned("local", prompt_id),
            )
            .await
            .unwrap();
    }
    store
        .transition(a.id, JobStatus::Completed, TransitionFields::default())
        .await
        .unwrap();
    store.cancel(c.id, Some(1), false).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed_today, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total, 4);
}

pub async fn retry_only_failed_jobs(store: &dyn JobStore) {
    let job = store.enqueue(Some(3), &json!({ "text": "cat" })).await.unwrap();

    let err = store.retry(job.id, Some(3), false).await.unwrap_err();
    assert_matches!(err, StoreError::Core(CoreError::Validation(_)));

    store
        .transition(
            job.id,
            JobStatus::Processing,
            TransitionFields::assigned("local", "p"),
        )
        .await
        .unwrap();
    store
        .transition(job.id, JobStatus::Failed, TransitionFields::failed("oom"))
        .await
        .unwrap();

    let retried = store.retry(job.id, Some(3), false).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.retry_of_job_id, Some(job.id));
    assert_eq!(retried.prompt, json!({ "text": "cat" }));
    assert_ne!(retried.id, job.id);
}

/// Many writers race to move the same PENDING job; exactly one wins each
/// edge and no illegal edge is ever applied.
pub async fn concurrent_transitions_serialize(store: Arc<dyn JobStore>) {
    let job = store.enqueue(Some(1), &json!("cat")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                store
                    .transition(
                        job.id,
                        JobStatus::Processing,
                        TransitionFields::assigned("local", format!("p{i}")),
                    )
                    .await
                    .map(|_| ())
            } else {
                store.cancel(job.id, Some(1), false).await.map(|_| ())
            }
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert!(e.is_state_error(), "unexpected error: {e}"),
        }
    }

    let finished = store.find_by_id(job.id).await.unwrap().unwrap();
    // Either one processing win followed by one cancel, or a single cancel.
    match finished.status {
        JobStatus::Cancelled => assert!(successes == 1 || successes == 2),
        other => panic!("unexpected final status {other}"),
    }
    assert!(finished.backend_id.is_none());
}
