//! Queue monitor: the control loop that advances jobs from PENDING to a
//! terminal state.
//!
//! Each tick dispatches PENDING jobs (oldest first) to the best healthy
//! backend, then polls every PROCESSING job's backend for completion. A
//! second task runs the server pool's periodic health check. Both are
//! owned by one [`QueueMonitor`], constructed once at boot and shared by
//! reference; [`QueueMonitor::start`] is idempotent and
//! [`QueueMonitor::stop`] lets the in-flight tick finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genorch_comfyui::pool::ServerPool;
use genorch_comfyui::retry::CallContext;
use genorch_core::types::{DbId, Timestamp};
use genorch_db::JobStore;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::{dispatch, poll};

/// Loop timing and limits.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Interval between dispatch/poll ticks.
    pub tick: Duration,
    /// Interval between backend health checks.
    pub health_interval: Duration,
    /// Upper bound on jobs submitted per tick.
    pub max_dispatch_per_tick: usize,
    /// Continuous backend unreachability after which a PROCESSING job fails.
    pub stuck_grace: Duration,
    /// Deadline for each logical backend call made by the loop.
    pub call_deadline: Duration,
    /// Bound on backend reads while polling and on prompt withdrawal. Keeps
    /// one unresponsive backend from holding up the tick or a request.
    pub probe_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            health_interval: Duration::from_secs(10),
            max_dispatch_per_tick: 4,
            stuck_grace: Duration::from_secs(300),
            call_deadline: Duration::from_secs(90),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Point-in-time view of the monitor for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    /// Number of active monitor loops; never more than one.
    pub loop_count: usize,
    pub started_at: Option<Timestamp>,
    pub ticks: u64,
    pub last_tick_at: Option<Timestamp>,
    /// Error that aborted the most recent tick, cleared by the next good one.
    pub last_error: Option<String>,
    pub dispatched_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

/// State shared by the loop task, manual ticks and status readers.
pub(crate) struct MonitorContext {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) pool: Arc<ServerPool>,
    pub(crate) settings: MonitorSettings,
    /// When each PROCESSING job's backend was first seen unreachable.
    pub(crate) unreachable_since: Mutex<HashMap<DbId, Instant>>,
    wake: Notify,
    tick_lock: Mutex<()>,
    ticks: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_tick_at: RwLock<Option<Timestamp>>,
    last_error: RwLock<Option<String>>,
}

impl MonitorContext {
    /// Deadline for one backend call starting now.
    pub(crate) fn call_context(&self) -> CallContext {
        CallContext::with_timeout(self.settings.call_deadline)
    }

    /// Deadline for one polling read starting now.
    pub(crate) fn probe_context(&self) -> CallContext {
        CallContext::with_timeout(self.settings.probe_timeout)
    }

    async fn tick(&self) -> Result<TickReport, PipelineError> {
        let _guard = self.tick_lock.lock().await;
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let result = async {
            let dispatched = dispatch::dispatch_pending(self).await?;
            let polled = poll::poll_processing(self).await?;
            Ok::<_, PipelineError>(TickReport {
                dispatched,
                completed: polled.completed,
                failed: polled.failed,
            })
        }
        .await;

        *self.last_tick_at.write().await = Some(Utc::now());
        match &result {
            Ok(report) => {
                self.dispatched
                    .fetch_add(report.dispatched as u64, Ordering::Relaxed);
                self.completed
                    .fetch_add(report.completed as u64, Ordering::Relaxed);
                self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
                *self.last_error.write().await = None;
                if *report != TickReport::default() {
                    tracing::debug!(
                        dispatched = report.dispatched,
                        completed = report.completed,
                        failed = report.failed,
                        "Monitor tick finished",
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Monitor tick aborted");
                *self.last_error.write().await = Some(e.to_string());
            }
        }
        result
    }
}

struct RunningLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    started_at: Timestamp,
}

/// Owner of the dispatch/poll loop and the health-check loop.
pub struct QueueMonitor {
    ctx: Arc<MonitorContext>,
    running: Mutex<Option<RunningLoops>>,
}

impl QueueMonitor {
    pub fn new(store: Arc<dyn JobStore>, pool: Arc<ServerPool>, settings: MonitorSettings) -> Self {
        Self {
            ctx: Arc::new(MonitorContext {
                store,
                pool,
                settings,
                unreachable_since: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                tick_lock: Mutex::new(()),
                ticks: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                last_tick_at: RwLock::new(None),
                last_error: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the loops. Returns `false` without side effects when they
    /// are already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Queue monitor already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(
                Arc::clone(&self.ctx.pool)
                    .run(self.ctx.settings.health_interval, cancel.child_token()),
            ),
            tokio::spawn(run_loop(Arc::clone(&self.ctx), cancel.child_token())),
        ];

        *running = Some(RunningLoops {
            cancel,
            handles,
            started_at: Utc::now(),
        });

        tracing::info!(
            tick_ms = self.ctx.settings.tick.as_millis() as u64,
            backends = self.ctx.pool.len(),
            "Queue monitor started",
        );
        true
    }

    /// Signal the loops to stop and wait for the current iteration to
    /// finish. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(loops) = running.take() else {
            return false;
        };

        loops.cancel.cancel();
        for handle in loops.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue monitor task ended abnormally");
            }
        }

        tracing::info!("Queue monitor stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> MonitorStatus {
        let running = self.running.lock().await;
        MonitorStatus {
            running: running.is_some(),
            loop_count: usize::from(running.is_some()),
            started_at: running.as_ref().map(|r| r.started_at),
            ticks: self.ctx.ticks.load(Ordering::Relaxed),
            last_tick_at: *self.ctx.last_tick_at.read().await,
            last_error: self.ctx.last_error.read().await.clone(),
            dispatched_total: self.ctx.dispatched.load(Ordering::Relaxed),
            completed_total: self.ctx.completed.load(Ordering::Relaxed),
            failed_total: self.ctx.failed.load(Ordering::Relaxed),
        }
    }

    /// Cut the current idle wait short, e.g. after an enqueue.
    pub fn wake(&self) {
        self.ctx.wake.notify_one();
    }

    /// Run one dispatch + poll cycle now, serialized with the loop.
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        self.ctx.tick().await
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.ctx.pool
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.ctx.settings
    }
}

async fn run_loop(ctx: Arc<MonitorContext>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.settings.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Queue monitor loop shutting down");
                break;
            }
            _ = ticker.tick() => {}
            _ = ctx.wake.notified() => {}
        }
        // Errors are logged and recorded inside; the next tick retries.
        let _ = ctx.tick().await;
    }
}
