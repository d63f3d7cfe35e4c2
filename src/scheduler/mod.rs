//! Time-based job movement.
//!
//! - **RetryScheduler**: tick loop promoting due scheduled jobs (initial
//!   delays and retry backoffs) into their priority queues under a lease
//! - **Lease**: TTL lock serializing promotion across instances
//! - **Reaper**: reclaims jobs abandoned in the processing list
//! - **CronScheduler**: materializes jobs from recurring `Schedule`s
//!
//! # Architecture
//!
//! ```text
//!   ┌───────────────┐   tick    ┌──────────────┐
//!   │ RetryScheduler│──────────▶│    Lease     │
//!   └──────┬────────┘           └──────────────┘
//!          │ promote_due                 │
//!          ▼                             ▼
//!   ┌──────────────┐  due ids   ┌──────────────┐
//!   │ Scheduled Set│──────────▶ │ Priority     │
//!   └──────────────┘            │ Queues       │
//!                               └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bananas::scheduler::{RetryScheduler, SchedulerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler = RetryScheduler::new(queue, store, &keys, SchedulerConfig::default());
//! let shutdown = CancellationToken::new();
//! scheduler.run(shutdown.clone()).await;
//! ```

pub mod cron;
pub mod lease;
pub mod reaper;
pub mod retry_scheduler;

use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

pub use self::cron::{
    load_schedules, parse_schedules, CronScheduler, JobTemplate, Schedule, ScheduleDefinition,
};
pub use lease::Lease;
pub use reaper::{ReapReport, Reaper, DEFAULT_VISIBILITY_TIMEOUT, VISIBILITY_TIMEOUT_ERROR};
pub use retry_scheduler::{RetryScheduler, SchedulerConfig, TickOutcome, SCHEDULER_LOCK};

/// Errors raised by the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid schedule '{name}': {message}")]
    InvalidSchedule { name: String, message: String },

    #[error("Failed to load schedules from {path}: {message}")]
    ScheduleFile { path: String, message: String },
}

impl SchedulerError {
    /// Returns whether the failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Queue(e) => e.is_retryable(),
            SchedulerError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
