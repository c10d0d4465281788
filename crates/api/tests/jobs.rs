//! Integration tests for the `/api/v1/jobs` endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, post, post_json, As, TestApp};
use genorch_core::job_status::JobStatus;
use genorch_db::JobStore;
use serde_json::json;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_201_with_pending_job() {
    let t = TestApp::spawn(1).await;

    let response = post_json(
        &t.app,
        "/api/v1/jobs",
        As::User(7),
        json!({ "prompt": { "3": { "class_type": "KSampler" } } }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["user_id"], 7);
    assert_eq!(json["data"]["attempts"], 0);
}

#[tokio::test]
async fn submit_empty_prompt_is_validation_error() {
    let t = TestApp::spawn(1).await;

    let response = post_json(&t.app, "/api/v1/jobs", As::User(1), json!({ "prompt": "" })).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn malformed_user_header_is_bad_request() {
    let t = TestApp::spawn(0).await;
    let req = axum::http::Request::builder()
        .uri("/api/v1/jobs")
        .header("x-user-id", "not-a-number")
        .body(axum::body::Body::empty())
        .unwrap();

    let response = tower::ServiceExt::oneshot(t.app.clone(), req).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_follows_job_through_completion() {
    let t = TestApp::spawn(1).await;
    let job = t.store.enqueue(Some(1), &json!("cat")).await.unwrap();
    let uri = format!("/api/v1/jobs/{}", job.id);

    let json = body_json(get(&t.app, &uri, As::User(1)).await).await;
    assert_eq!(json["data"]["state"], "pending");
    assert_eq!(json["data"]["queue_position"], 1);

    t.monitor.tick().await.unwrap();
    let json = body_json(get(&t.app, &uri, As::User(1)).await).await;
    assert_eq!(json["data"]["state"], "processing");
    assert_eq!(json["data"]["backend_id"], "local");
    assert!(json["data"]["queue_position"].is_null());

    let prompt_id = json["data"]["backend_prompt_id"].as_str().unwrap().to_string();
    t.local().complete(&prompt_id, json!({ "9": { "images": [] } })).await;
    t.monitor.tick().await.unwrap();

    let json = body_json(get(&t.app, &uri, As::User(1)).await).await;
    assert_eq!(json["data"]["state"], "completed");
    assert_eq!(json["data"]["result"], json!({ "9": { "images": [] } }));
}

#[tokio::test]
async fn status_of_other_users_job_is_forbidden() {
    let t = TestApp::spawn(0).await;
    let job = t.store.enqueue(Some(1), &json!("cat")).await.unwrap();
    let uri = format!("/api/v1/jobs/{}", job.id);

    let response = get(&t.app, &uri, As::User(2)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "FORBIDDEN");

    let response = get(&t.app, &uri, As::Admin(99)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_of_missing_job_is_404() {
    let t = TestApp::spawn(0).await;

    let response = get(&t.app, "/api/v1/jobs/4242", As::Admin(1)).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Cancel / retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_pending_then_cancel_again_conflicts() {
    let t = TestApp::spawn(1).await;
    let job = t.store.enqueue(Some(1), &json!("cat")).await.unwrap();
    let uri = format!("/api/v1/jobs/{}/cancel", job.id);

    let response = post(&t.app, &uri, As::User(1)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "cancelled");
    assert_eq!(t.local().submissions(), 0);

    let response = post(&t.app, &uri, As::User(1)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "STATE_ERROR");
}

#[tokio::test]
async fn cancel_processing_withdraws_from_backend() {
    let t = TestApp::spawn(1).await;
    let job = t.store.enqueue(Some(1), &json!("cat")).await.unwrap();
    t.monitor.tick().await.unwrap();
    let prompt_id = t
        .store
        .find_by_id(job.id)
        .await
        .unwrap()
        .unwrap()
        .backend_prompt_id
        .unwrap();

    let response = post(&t.app, &format!("/api/v1/jobs/{}/cancel", job.id), As::User(1)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.local().deleted().await, vec![prompt_id]);
}

#[tokio::test]
async fn retry_only_failed_jobs() {
    let t = TestApp::spawn(1).await;
    let job = t.store.enqueue(Some(3), &json!("cat")).await.unwrap();
    let uri = format!("/api/v1/jobs/{}/retry", job.id);

    let response = post(&t.app, &uri, As::User(3)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");

    t.monitor.tick().await.unwrap();
    let prompt_id = t
        .store
        .find_by_id(job.id)
        .await
        .unwrap()
        .unwrap()
        .backend_prompt_id
        .unwrap();
    t.local().fail(&prompt_id, "out of memory").await;
    t.monitor.tick().await.unwrap();

    let response = post(&t.app, &uri, As::User(3)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["retry_of_job_id"], job.id);
}

// ---------------------------------------------------------------------------
// List / stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_is_scoped_and_filterable() {
    let t = TestApp::spawn(0).await;
    t.store.enqueue(Some(1), &json!("a")).await.unwrap();
    let cancelled = t.store.enqueue(Some(1), &json!("b")).await.unwrap();
    t.store.enqueue(Some(2), &json!("c")).await.unwrap();
    t.store.cancel(cancelled.id, Some(1), false).await.unwrap();

    let json = body_json(get(&t.app, "/api/v1/jobs", As::User(1)).await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);

    let json = body_json(get(&t.app, "/api/v1/jobs", As::Admin(9)).await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 3);

    let json = body_json(get(&t.app, "/api/v1/jobs?status=pending&limit=1", As::Admin(9)).await).await;
    let data = json["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["status"], JobStatus::Pending.as_str());

    let response = get(&t.app, "/api/v1/jobs", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stats_counts_by_status() {
    let t = TestApp::spawn(0).await;
    t.store.enqueue(None, &json!("a")).await.unwrap();
    let b = t.store.enqueue(None, &json!("b")).await.unwrap();
    t.store.cancel(b.id, None, true).await.unwrap();

    let response = get(&t.app, "/api/v1/jobs/stats", As::Anonymous).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["pending"], 1);
    assert_eq!(json["data"]["cancelled"], 1);
    assert_eq!(json["data"]["completed_today"], 0);
    assert_eq!(json["data"]["total"], 2);
}
