use std::str::FromStr;
use std::time::Duration;

use genorch_comfyui::pool::PoolSettings;
use genorch_comfyui::retry::RetryPolicy;
use genorch_core::backend::BackendDescriptor;

use crate::monitor::MonitorSettings;

/// A configuration variable that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} must be {expected}, got \"{value}\"")]
pub struct ConfigError {
    pub var: &'static str,
    pub expected: &'static str,
    pub value: String,
}

/// Backend set and timing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Local backend base URL; `None` when disabled.
    pub local_url: Option<String>,
    /// Remote backend base URLs, in `remote-1`, `remote-2`, ... order.
    pub remote_urls: Vec<String>,
    pub local_priority: i32,
    pub remote_priority: i32,
    /// Per-attempt HTTP timeout.
    pub backend_timeout: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Linear backoff unit.
    pub retry_base_delay: Duration,
    /// Bound on liveness and queue probes.
    pub ping_timeout: Duration,
    pub health_check_interval: Duration,
    /// Age after which cached health is refreshed before selection.
    pub health_stale_after: Duration,
    pub dispatch_tick: Duration,
    pub max_dispatch_per_tick: usize,
    /// How long a PROCESSING job's backend may stay unreachable.
    pub stuck_job_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_url: Some("http://127.0.0.1:8188".to_string()),
            remote_urls: Vec::new(),
            local_priority: 0,
            remote_priority: 0,
            backend_timeout: Duration::from_millis(30_000),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(2_000),
            health_check_interval: Duration::from_millis(10_000),
            health_stale_after: Duration::from_millis(5_000),
            dispatch_tick: Duration::from_millis(1_000),
            max_dispatch_per_tick: 4,
            stuck_job_grace: Duration::from_secs(300),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                 |
    /// |----------------------------|-------------------------|
    /// | `COMFYUI_LOCAL_URL`        | `http://127.0.0.1:8188` |
    /// | `COMFYUI_REMOTE_URLS`      | (none)                  |
    /// | `COMFYUI_LOCAL_PRIORITY`   | `0`                     |
    /// | `COMFYUI_REMOTE_PRIORITY`  | `0`                     |
    /// | `BACKEND_TIMEOUT_MS`       | `30000`                 |
    /// | `BACKEND_MAX_RETRIES`      | `2`                     |
    /// | `BACKEND_RETRY_DELAY_MS`   | `500`                   |
    /// | `BACKEND_PING_TIMEOUT_MS`  | `2000`                  |
    /// | `HEALTH_CHECK_INTERVAL_MS` | `10000`                 |
    /// | `HEALTH_STALE_AFTER_MS`    | `5000`                  |
    /// | `DISPATCH_TICK_MS`         | `1000`                  |
    /// | `MAX_DISPATCH_PER_TICK`    | `4`                     |
    /// | `STUCK_JOB_GRACE_SECS`     | `300`                   |
    ///
    /// An empty `COMFYUI_LOCAL_URL` disables the local backend.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let local_url = match lookup("COMFYUI_LOCAL_URL") {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url.trim().to_string()),
            None => defaults.local_url,
        };

        let remote_urls = lookup("COMFYUI_REMOTE_URLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, var, default.as_millis() as u64, "milliseconds").map(Duration::from_millis)
        };
        let positive_millis = |var: &'static str, default: Duration| {
            parse_positive(&lookup, var, default.as_millis() as u64, "a positive number of milliseconds")
                .map(Duration::from_millis)
        };

        Ok(Self {
            local_url,
            remote_urls,
            local_priority: parse(&lookup, "COMFYUI_LOCAL_PRIORITY", 0, "an integer")?,
            remote_priority: parse(&lookup, "COMFYUI_REMOTE_PRIORITY", 0, "an integer")?,
            backend_timeout: positive_millis("BACKEND_TIMEOUT_MS", defaults.backend_timeout)?,
            max_retries: parse(
                &lookup,
                "BACKEND_MAX_RETRIES",
                defaults.max_retries,
                "a non-negative integer",
            )?,
            retry_base_delay: millis("BACKEND_RETRY_DELAY_MS", defaults.retry_base_delay)?,
            ping_timeout: positive_millis("BACKEND_PING_TIMEOUT_MS", defaults.ping_timeout)?,
            health_check_interval: positive_millis(
                "HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval,
            )?,
            health_stale_after: millis("HEALTH_STALE_AFTER_MS", defaults.health_stale_after)?,
            dispatch_tick: positive_millis("DISPATCH_TICK_MS", defaults.dispatch_tick)?,
            max_dispatch_per_tick: parse_positive(
                &lookup,
                "MAX_DISPATCH_PER_TICK",
                defaults.max_dispatch_per_tick,
                "a positive integer",
            )?,
            stuck_job_grace: Duration::from_secs(parse(
                &lookup,
                "STUCK_JOB_GRACE_SECS",
                defaults.stuck_job_grace.as_secs(),
                "seconds",
            )?),
        })
    }

    /// Local descriptor first, then remotes numbered from 1.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let local = self
            .local_url
            .as_deref()
            .map(|url| BackendDescriptor::local(url, self.local_priority));
        let remotes = self
            .remote_urls
            .iter()
            .enumerate()
            .map(|(i, url)| BackendDescriptor::remote(i + 1, url.as_str(), self.remote_priority));
        local.into_iter().chain(remotes).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.backend_timeout,
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            policy: self.retry_policy(),
            ping_timeout: self.ping_timeout,
            stale_after: self.health_stale_after,
        }
    }

    /// Upper bound on one logical backend call: every attempt timing out
    /// plus every backoff sleep.
    pub fn call_deadline(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let backoff_units = u32::try_from(
            u64::from(self.max_retries) * u64::from(attempts) / 2,
        )
        .unwrap_or(u32::MAX);
        self.backend_timeout
            .saturating_mul(attempts)
            .saturating_add(self.retry_base_delay.saturating_mul(backoff_units))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            tick: self.dispatch_tick,
            health_interval: self.health_check_interval,
            max_dispatch_per_tick: self.max_dispatch_per_tick,
            stuck_grace: self.stuck_job_grace,
            call_deadline: self.call_deadline(),
            probe_timeout: self.ping_timeout,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|_| ConfigError {
                var,
                expected,
                value,
            })
        }
        _ => Ok(default),
    }
}

/// Like [`parse`], but zero is rejected too.
fn parse_positive<T: FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    let value = parse(lookup, var, default, expected)?;
    if value == T::default() {
        return Err(ConfigError {
            var,
            expected,
            value: lookup(var).unwrap_or_default(),
        });
    }
    Ok(value)
}
