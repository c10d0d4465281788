//! Shared harness: fake backends, an in-memory store and a monitor with
//! short timings.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use genorch_comfyui::fake::FakeComfyUI;
use genorch_comfyui::pool::{PoolSettings, ServerPool};
use genorch_comfyui::retry::RetryPolicy;
use genorch_core::backend::BackendDescriptor;
use genorch_core::job_status::JobStatus;
use genorch_core::types::DbId;
use genorch_db::models::job::{Job, JobListQuery, JobStats};
use genorch_db::{InMemoryJobStore, JobStore, StoreError, TransitionFields};
use tokio::net::TcpListener;
use genorch_pipeline::monitor::{MonitorSettings, QueueMonitor};
use genorch_pipeline::service::JobService;

pub fn monitor_settings() -> MonitorSettings {
    MonitorSettings {
        tick: Duration::from_millis(50),
        health_interval: Duration::from_millis(100),
        max_dispatch_per_tick: 4,
        stuck_grace: Duration::from_millis(200),
        call_deadline: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(300),
    }
}

fn pool_settings() -> PoolSettings {
    PoolSettings {
        policy: RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 0,
            base_delay: Duration::from_millis(10),
        },
        ping_timeout: Duration::from_millis(500),
        // Refresh health before every selection.
        stale_after: Duration::ZERO,
    }
}

pub struct Harness {
    /// Index 0 is the local backend, the rest are `remote-1`, ...
    pub fakes: Vec<FakeComfyUI>,
    pub store: Arc<InMemoryJobStore>,
    pub monitor: Arc<QueueMonitor>,
    pub service: JobService,
}

impl Harness {
    pub async fn new(backends: usize) -> Self {
        Self::with_settings(backends, monitor_settings()).await
    }

    pub async fn with_settings(backends: usize, settings: MonitorSettings) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        Self::build(backends, &[], settings, Arc::clone(&store), store).await
    }

    /// `backends` fakes followed by extra remotes at the given URLs. The
    /// monitor and service use `monitor_store`; `store` is what tests
    /// inspect.
    pub async fn build(
        backends: usize,
        extra_remotes: &[String],
        settings: MonitorSettings,
        store: Arc<InMemoryJobStore>,
        monitor_store: Arc<dyn JobStore>,
    ) -> Self {
        let mut fakes = Vec::with_capacity(backends);
        for _ in 0..backends {
            fakes.push(FakeComfyUI::spawn().await.unwrap());
        }

        let urls = fakes
            .iter()
            .map(|fake| fake.base_url().to_string())
            .chain(extra_remotes.iter().cloned());
        let descriptors = urls
            .enumerate()
            .map(|(i, url)| match i {
                0 => BackendDescriptor::local(url, 0),
                n => BackendDescriptor::remote(n, url, 0),
            })
            .collect();
        let pool = Arc::new(ServerPool::new(descriptors, pool_settings()).unwrap());

        let monitor = Arc::new(QueueMonitor::new(Arc::clone(&monitor_store), pool, settings));
        let service = JobService::new(monitor_store, Arc::clone(&monitor));

        Self {
            fakes,
            store,
            monitor,
            service,
        }
    }

    pub fn local(&self) -> &FakeComfyUI {
        &self.fakes[0]
    }

    pub async fn job(&self, id: DbId) -> Job {
        self.store.find_by_id(id).await.unwrap().unwrap()
    }

    /// Poll the store until `check` holds or two seconds pass.
    pub async fn wait_for(&self, id: DbId, check: impl Fn(&Job) -> bool) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = self.job(id).await;
            if check(&job) || tokio::time::Instant::now() > deadline {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// A backend that accepts connections and never answers.
pub async fn unresponsive_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// In-memory store whose `list_pending` can be made to fail once.
pub struct FlakyStore {
    inner: Arc<InMemoryJobStore>,
    fail_next_list: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryJobStore>) -> Self {
        Self {
            inner,
            fail_next_list: AtomicBool::new(false),
        }
    }

    pub fn fail_next_list_pending(&self) {
        self.fail_next_list.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(
        &self,
        user_id: Option<DbId>,
        prompt: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        self.inner.enqueue(user_id, prompt).await
    }

    async fn retry(
        &self,
        job_id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        self.inner.retry(job_id, requester_id, is_admin).await
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn transition(
        &self,
        id: DbId,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, StoreError> {
        self.inner.transition(id, to, fields).await
    }

    async fn record_attempt(&self, id: DbId, error: Option<&str>) -> Result<Job, StoreError> {
        self.inner.record_attempt(id, error).await
    }

    async fn cancel(
        &self,
        id: DbId,
        requester_id: Option<DbId>,
        is_admin: bool,
    ) -> Result<Job, StoreError> {
        self.inner.cancel(id, requester_id, is_admin).await
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        if self.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.list_pending().await
    }

    async fn list_processing(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.list_processing().await
    }

    async fn list_by_user(
        &self,
        user_id: DbId,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_by_user(user_id, params).await
    }

    async fn list_all(&self, params: &JobListQuery) -> Result<Vec<Job>, StoreError> {
        self.inner.list_all(params).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        self.inner.stats().await
    }
}
