//! Shared helpers for API integration tests: a router wired to fake
//! backends and an in-memory job store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use genorch_comfyui::fake::FakeComfyUI;
use genorch_comfyui::pool::{PoolSettings, ServerPool};
use genorch_comfyui::retry::RetryPolicy;
use genorch_core::backend::BackendDescriptor;
use genorch_db::{InMemoryJobStore, JobStore};
use genorch_pipeline::config::OrchestratorConfig;
use genorch_pipeline::monitor::{MonitorSettings, QueueMonitor};
use genorch_pipeline::service::JobService;
use http_body_util::BodyExt;
use tower::ServiceExt;

use genorch_api::config::ServerConfig;
use genorch_api::router::build_app_router;
use genorch_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        database_url: None,
        orchestrator: OrchestratorConfig::default(),
    }
}

pub struct TestApp {
    pub app: Router,
    /// Index 0 is the local backend, the rest are `remote-1`, ...
    pub fakes: Vec<FakeComfyUI>,
    pub store: Arc<InMemoryJobStore>,
    pub monitor: Arc<QueueMonitor>,
}

impl TestApp {
    /// Full router over `backends` fake servers. The monitor is not
    /// started; tests drive it with [`QueueMonitor::tick`].
    pub async fn spawn(backends: usize) -> Self {
        let mut fakes = Vec::with_capacity(backends);
        for _ in 0..backends {
            fakes.push(FakeComfyUI::spawn().await.unwrap());
        }
        let descriptors = fakes
            .iter()
            .enumerate()
            .map(|(i, fake)| match i {
                0 => BackendDescriptor::local(fake.base_url(), 0),
                n => BackendDescriptor::remote(n, fake.base_url(), 0),
            })
            .collect();
        let settings = PoolSettings {
            policy: RetryPolicy {
                timeout: Duration::from_secs(1),
                max_retries: 0,
                base_delay: Duration::from_millis(10),
            },
            ping_timeout: Duration::from_millis(500),
            stale_after: Duration::ZERO,
        };
        let pool = Arc::new(ServerPool::new(descriptors, settings).unwrap());

        let store = Arc::new(InMemoryJobStore::new());
        let dyn_store: Arc<dyn JobStore> = store.clone();
        let monitor = Arc::new(QueueMonitor::new(
            Arc::clone(&dyn_store),
            pool,
            MonitorSettings {
                tick: Duration::from_millis(50),
                health_interval: Duration::from_millis(100),
                max_dispatch_per_tick: 4,
                stuck_grace: Duration::from_secs(5),
                call_deadline: Duration::from_secs(2),
                probe_timeout: Duration::from_millis(300),
            },
        ));

        let config = test_config();
        let state = AppState {
            config: Arc::new(config.clone()),
            service: JobService::new(dyn_store, Arc::clone(&monitor)),
        };

        Self {
            app: build_app_router(state, &config),
            fakes,
            store,
            monitor,
        }
    }

    pub fn local(&self) -> &FakeComfyUI {
        &self.fakes[0]
    }
}

/// Who the gateway says is calling.
#[derive(Debug, Clone, Copy)]
pub enum As {
    Anonymous,
    User(i64),
    Admin(i64),
}

fn request(method: Method, uri: &str, who: As) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    match who {
        As::Anonymous => builder,
        As::User(id) => builder.header("x-user-id", id.to_string()),
        As::Admin(id) => builder
            .header("x-user-id", id.to_string())
            .header("x-user-role", "admin"),
    }
}

pub async fn get(app: &Router, uri: &str, who: As) -> Response<Body> {
    let req = request(Method::GET, uri, who).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.unwrap()
}

pub async fn post(app: &Router, uri: &str, who: As) -> Response<Body> {
    let req = request(Method::POST, uri, who).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.unwrap()
}

pub async fn post_json(
    app: &Router,
    uri: &str,
    who: As,
    body: serde_json::Value,
) -> Response<Body> {
    let req = request(Method::POST, uri, who)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(req).await.unwrap()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
