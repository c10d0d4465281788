//! Compute backend identity, runtime health, and selection ordering.
//!
//! Descriptors are the immutable identity set built once from
//! configuration. [`BackendStatus`] holds the mutable health/metrics
//! row for a descriptor; the two are kept side by side (same index) by
//! the server pool so the selection code only ever sees snapshots.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Identifier of the single local backend.
pub const LOCAL_BACKEND_ID: &str = "local";

/// Prefix for remote backend identifiers (`remote-1`, `remote-2`, ...).
pub const REMOTE_BACKEND_PREFIX: &str = "remote-";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    /// Local sorts before remote when everything else is equal.
    fn rank(self) -> u8 {
        match self {
            BackendKind::Local => 0,
            BackendKind::Remote => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Static identity of one compute backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub kind: BackendKind,
    /// HTTP base URL without trailing slash, e.g. `http://host:8188`.
    pub base_url: String,
    /// Tie-break weight; lower wins.
    pub priority: i32,
}

impl BackendDescriptor {
    pub fn local(base_url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: LOCAL_BACKEND_ID.to_string(),
            kind: BackendKind::Local,
            base_url: normalize_base_url(&base_url.into()),
            priority,
        }
    }

    /// Remote backend number `ordinal` (1-based).
    pub fn remote(ordinal: usize, base_url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: format!("{REMOTE_BACKEND_PREFIX}{ordinal}"),
            kind: BackendKind::Remote,
            base_url: normalize_base_url(&base_url.into()),
            priority,
        }
    }
}

/// Mutable runtime row for one backend, written only by health checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStatus {
    pub health: BackendHealth,
    pub last_checked_at: Option<Timestamp>,
    /// Queued plus executing prompts; `None` when unknown.
    pub queue_depth: Option<u32>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Total order used to rank candidates: lowest known queue depth first
/// (unknown depth last), then priority, then local before remote, then id.
pub fn compare_candidates(
    a: (&BackendDescriptor, &BackendStatus),
    b: (&BackendDescriptor, &BackendStatus),
) -> Ordering {
    let depth_key = |s: &BackendStatus| (s.queue_depth.is_none(), s.queue_depth.unwrap_or(0));

    depth_key(a.1)
        .cmp(&depth_key(b.1))
        .then_with(|| a.0.priority.cmp(&b.0.priority))
        .then_with(|| a.0.kind.rank().cmp(&b.0.kind.rank()))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

/// Pick the best healthy backend, or `None` when nothing is healthy.
pub fn select_best<'a, I>(candidates: I) -> Option<&'a BackendDescriptor>
where
    I: IntoIterator<Item = (&'a BackendDescriptor, &'a BackendStatus)>,
{
    candidates
        .into_iter()
        .filter(|(_, status)| status.health == BackendHealth::Healthy)
        .min_by(|a, b| compare_candidates(*a, *b))
        .map(|(descriptor, _)| descriptor)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a configured backend set.
///
/// Rules:
/// - At most one local backend.
/// - Ids are unique.
/// - Base URLs are non-empty and start with `http://` or `https://`.
pub fn validate_descriptors(descriptors: &[BackendDescriptor]) -> Result<(), CoreError> {
    let locals = descriptors
        .iter()
        .filter(|d| d.kind == BackendKind::Local)
        .count();
    if locals > 1 {
        return Err(CoreError::Validation(format!(
            "At most one local backend may be configured, found {locals}"
        )));
    }

    let mut seen = HashSet::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !seen.insert(descriptor.id.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate backend id: \"{}\"",
                descriptor.id
            )));
        }
        if !(descriptor.base_url.starts_with("http://")
            || descriptor.base_url.starts_with("https://"))
        {
            return Err(CoreError::Validation(format!(
                "Backend \"{}\" has invalid base URL \"{}\"",
                descriptor.id, descriptor.base_url
            )));
        }
    }

    Ok(())
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
