use crate::job_status::JobStatus;
use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested status change is not an edge of the job state machine.
    #[error("Illegal job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The job already reached a terminal status.
    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: DbId, status: JobStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True for the state-machine family of errors (illegal transition or
    /// already terminal).
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidTransition { .. } | CoreError::AlreadyTerminal { .. }
        )
    }
}
