//! Job-level failure taxonomy.
//!
//! These errors never cross the producer/consumer boundary as errors: the
//! dispatcher turns them into data on the job record and the result backend.
//!
//! - `HandlerNotFound`: registration problem, dead-lettered without retry
//! - `HandlerTimeout`: hard deadline hit, retryable, counts as an attempt
//! - `HandlerFailure`: handler error or panic, retryable, counts as an attempt
//!
//! Store outages are subsystem errors (`StoreError`) and are retried by the
//! calling loop without touching the job's retry budget.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while executing a single job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("No handler registered for job '{0}'")]
    HandlerNotFound(String),

    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("Handler failed: {0}")]
    HandlerFailure(String),
}

impl JobError {
    /// Returns whether the failure consumes an attempt and may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::HandlerNotFound(_))
    }
}
