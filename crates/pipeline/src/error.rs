use genorch_comfyui::api::ComfyUIApiError;
use genorch_core::error::CoreError;
use genorch_db::StoreError;

/// Errors surfaced by the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A domain rule was violated.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The job store failed; fatal for the current monitor tick.
    #[error(transparent)]
    Store(StoreError),

    /// No backend is healthy right now. Transient.
    #[error("No healthy backend available")]
    BackendUnavailable,

    /// The selected backend rejected the prompt or stayed unreachable
    /// after retries. The job remains PENDING.
    #[error("Submission to backend \"{backend_id}\" failed: {source}")]
    Submission {
        backend_id: String,
        #[source]
        source: ComfyUIApiError,
    },

    #[error("Unknown backend \"{0}\"")]
    UnknownBackend(String),

    /// A read-only backend call failed.
    #[error("Backend \"{backend_id}\" request failed: {source}")]
    Backend {
        backend_id: String,
        #[source]
        source: ComfyUIApiError,
    },
}

impl From<StoreError> for PipelineError {
    /// Domain errors keep their identity so callers can map them
    /// uniformly; only storage failures stay wrapped.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(core) => PipelineError::Core(core),
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// True when the error comes from the job state machine.
    pub fn is_state_error(&self) -> bool {
        matches!(self, PipelineError::Core(core) if core.is_state_error())
    }
}
