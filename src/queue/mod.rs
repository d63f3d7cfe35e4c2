//! Job queue core.
//!
//! - `job`: job, priority, status and result types
//! - `priority`: per-route priority lists with reliable dequeue
//! - `scheduled`: time-ordered set of deferred job ids
//! - `dead_letter`: terminally failed job ids
//! - `records`: job records and status indexes
//! - `retry`: exponential backoff policy
//! - `job_queue`: `JobQueue`, which composes the above into state transitions

pub mod dead_letter;
pub mod job;
pub mod job_queue;
pub mod priority;
pub mod records;
pub mod retry;
pub mod scheduled;

pub use dead_letter::DeadLetterQueue;
pub use job::{
    Job, JobId, JobResult, JobStatus, ParseEnumError, Priority, ResultStatus,
    DEFAULT_MAX_RETRIES,
};
pub use job_queue::{FailureOutcome, JobQueue, QueueDepths, QueueError};
pub use priority::{PriorityQueues, QueueDepth, DEFAULT_DEQUEUE_SLICE};
pub use records::JobRecords;
pub use retry::RetryPolicy;
pub use scheduled::ScheduledSet;
