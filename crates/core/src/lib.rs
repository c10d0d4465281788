//! Domain building blocks for the generation job orchestrator.
//!
//! Pure types and functions with no I/O: identifiers, the shared error
//! type, the job status state machine, backend descriptors with their
//! selection ordering, and prompt validation.

pub mod backend;
pub mod error;
pub mod job_status;
pub mod prompt;
pub mod types;
