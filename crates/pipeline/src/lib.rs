//! Job orchestration: the queue monitor that moves jobs from PENDING to a
//! terminal state, its configuration, and the [`service::JobService`]
//! façade used by the HTTP layer.

pub mod config;
mod dispatch;
pub mod error;
pub mod monitor;
mod poll;
pub mod service;
pub mod status;
