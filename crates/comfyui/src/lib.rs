//! ComfyUI REST client and server pool.
//!
//! Provides a retrying HTTP client for one ComfyUI instance
//! ([`api::ComfyUIApi`]), typed response payloads, and the
//! [`pool::ServerPool`] that health-checks every configured instance and
//! picks the best one for a new job.

pub mod api;
#[cfg(feature = "test-util")]
pub mod fake;
pub mod messages;
pub mod pool;
pub mod retry;
