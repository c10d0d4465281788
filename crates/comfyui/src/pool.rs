//! Registry of configured ComfyUI backends and their health.
//!
//! Descriptors and API clients are fixed at construction and stored in a
//! slice; the mutable [`BackendStatus`] rows live in a parallel table
//! behind one `RwLock`, addressed by the same index. Health checks probe
//! every backend concurrently and each probe writes only its own row, so
//! a slow backend never delays the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use genorch_core::backend::{
    select_best, validate_descriptors, BackendDescriptor, BackendHealth, BackendStatus,
};
use genorch_core::error::CoreError;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::retry::RetryPolicy;

/// Timing knobs for a [`ServerPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Retry policy for every backend call except probes.
    pub policy: RetryPolicy,
    /// Bound on each liveness and queue probe.
    pub ping_timeout: Duration,
    /// How old a health snapshot may get before selection refreshes it.
    pub stale_after: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            ping_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(5),
        }
    }
}

/// One backend as exposed to callers: identity plus latest status.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,
    #[serde(flatten)]
    pub status: BackendStatus,
}

struct Member {
    descriptor: BackendDescriptor,
    api: ComfyUIApi,
}

/// Health-tracked set of backends with best-candidate selection.
pub struct ServerPool {
    members: Box<[Member]>,
    index: HashMap<String, usize>,
    statuses: RwLock<Vec<BackendStatus>>,
    /// Completion time of the last full health check.
    last_refresh: RwLock<Option<Instant>>,
    /// Serializes health checks so overlapping callers share one round.
    refresh_lock: Mutex<()>,
    stale_after: Duration,
}

impl ServerPool {
    /// Build a pool after validating the descriptor set.
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        settings: PoolSettings,
    ) -> Result<Self, CoreError> {
        validate_descriptors(&descriptors)?;

        let client = reqwest::Client::new();
        let members: Box<[Member]> = descriptors
            .into_iter()
            .map(|descriptor| Member {
                api: ComfyUIApi::with_client(
                    client.clone(),
                    descriptor.base_url.clone(),
                    settings.policy.clone(),
                    settings.ping_timeout,
                ),
                descriptor,
            })
            .collect();

        let index = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.descriptor.id.clone(), i))
            .collect();

        Ok(Self {
            statuses: RwLock::new(vec![BackendStatus::default(); members.len()]),
            members,
            index,
            last_refresh: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            stale_after: settings.stale_after,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.members.iter().map(|m| &m.descriptor)
    }

    pub fn descriptor(&self, backend_id: &str) -> Option<&BackendDescriptor> {
        self.index
            .get(backend_id)
            .map(|&i| &self.members[i].descriptor)
    }

    /// API client for a backend id.
    pub fn api(&self, backend_id: &str) -> Option<&ComfyUIApi> {
        self.index.get(backend_id).map(|&i| &self.members[i].api)
    }

    pub async fn status(&self, backend_id: &str) -> Option<BackendStatus> {
        let &i = self.index.get(backend_id)?;
        Some(self.statuses.read().await[i].clone())
    }

    /// Every backend with its latest status, in configuration order.
    pub async fn snapshot(&self) -> Vec<BackendSnapshot> {
        let statuses = self.statuses.read().await;
        self.members
            .iter()
            .zip(statuses.iter())
            .map(|(m, s)| BackendSnapshot {
                descriptor: m.descriptor.clone(),
                status: s.clone(),
            })
            .collect()
    }

    /// Probe every backend concurrently and record the results.
    pub async fn check_health(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.probe_all().await;
    }

    /// True when no health check has completed within `stale_after`.
    pub async fn is_stale(&self) -> bool {
        match *self.last_refresh.read().await {
            Some(at) => at.elapsed() > self.stale_after,
            None => true,
        }
    }

    /// Run a health check unless a fresh one already exists. Callers that
    /// arrive while a check is running wait for it instead of starting
    /// another.
    pub async fn refresh_if_stale(&self) {
        if !self.is_stale().await {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        if self.is_stale().await {
            self.probe_all().await;
        }
    }

    /// Best healthy backend according to the cached statuses.
    pub async fn select_best(&self) -> Option<BackendDescriptor> {
        self.select_best_where(|_| true).await
    }

    /// Best healthy backend among those `eligible` accepts.
    pub async fn select_best_where(
        &self,
        eligible: impl Fn(&BackendDescriptor) -> bool,
    ) -> Option<BackendDescriptor> {
        let statuses = self.statuses.read().await;
        let candidates = self
            .descriptors()
            .zip(statuses.iter())
            .filter(|&(descriptor, _)| eligible(descriptor));
        let best = select_best(candidates).cloned();
        best
    }

    /// Refresh stale health data, then select.
    pub async fn select_best_fresh(&self) -> Option<BackendDescriptor> {
        self.select_best_fresh_where(|_| true).await
    }

    /// Refresh stale health data, then select among eligible backends.
    pub async fn select_best_fresh_where(
        &self,
        eligible: impl Fn(&BackendDescriptor) -> bool,
    ) -> Option<BackendDescriptor> {
        self.refresh_if_stale().await;
        self.select_best_where(eligible).await
    }

    /// Account for a prompt just submitted to `backend_id` so the next
    /// selection in the same cycle sees the deeper queue.
    pub async fn note_dispatched(&self, backend_id: &str) {
        let Some(&i) = self.index.get(backend_id) else {
            return;
        };
        if let Some(depth) = self.statuses.write().await[i].queue_depth.as_mut() {
            *depth += 1;
        }
    }

    /// Periodic health checks until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            backends = self.len(),
            interval_ms = interval.as_millis() as u64,
            "Backend health loop started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Backend health loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_health().await;
                }
            }
        }
    }

    // ---- private helpers ----

    async fn probe_all(&self) {
        join_all((0..self.members.len()).map(|i| self.probe_and_record(i))).await;
        *self.last_refresh.write().await = Some(Instant::now());
    }

    async fn probe_and_record(&self, i: usize) {
        let member = &self.members[i];
        let status = Self::probe(&member.api).await;

        let mut statuses = self.statuses.write().await;
        let previous = statuses[i].health;
        log_health_change(&member.descriptor.id, previous, &status);
        statuses[i] = status;
    }

    /// Liveness first; queue depth is best effort and never downgrades a
    /// backend that answered the liveness probe.
    async fn probe(api: &ComfyUIApi) -> BackendStatus {
        let checked_at = Some(Utc::now());

        if let Err(e) = api.probe().await {
            return BackendStatus {
                health: BackendHealth::Unhealthy,
                last_checked_at: checked_at,
                queue_depth: None,
                last_error: Some(e.to_string()),
            };
        }

        match api.probe_queue_depth().await {
            Ok(depth) => BackendStatus {
                health: BackendHealth::Healthy,
                last_checked_at: checked_at,
                queue_depth: Some(depth),
                last_error: None,
            },
            Err(e) => BackendStatus {
                health: BackendHealth::Healthy,
                last_checked_at: checked_at,
                queue_depth: None,
                last_error: Some(format!("Queue depth unavailable: {e}")),
            },
        }
    }
}

fn log_health_change(backend_id: &str, previous: BackendHealth, current: &BackendStatus) {
    if previous == current.health {
        return;
    }
    match current.health {
        BackendHealth::Healthy => tracing::info!(
            backend_id,
            queue_depth = ?current.queue_depth,
            "Backend is healthy",
        ),
        BackendHealth::Unhealthy => tracing::warn!(
            backend_id,
            error = current.last_error.as_deref().unwrap_or(""),
            "Backend is unhealthy",
        ),
        BackendHealth::Unknown => {}
    }
}
