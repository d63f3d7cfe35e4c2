//! Processing-list reclaim.
//!
//! A worker that dies mid-job leaves the job id in the processing list. The
//! reaper sweeps that list and settles every entry by the state of its record:
//!
//! - `processing` and started longer than the visibility timeout ago: the
//!   execution is treated as a failed attempt and goes through the normal
//!   retry / dead letter path
//! - `pending` on two consecutive sweeps: the worker died between claim and
//!   start; the job goes back to the tail of its queue without using an attempt
//! - missing, `scheduled` or terminal: the outcome was already recorded and
//!   only the processing entry is left over, so it is dropped

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::queue::{JobId, JobQueue, JobStatus, QueueError};

/// Default time a job may stay `processing` before it is presumed abandoned.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Error recorded on jobs reclaimed after their visibility timeout.
pub const VISIBILITY_TIMEOUT_ERROR: &str = "visibility timeout expired";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Abandoned executions charged as failed attempts.
    pub reclaimed: usize,
    /// Claimed-but-never-started jobs put back in their queue.
    pub requeued: usize,
    /// Leftover entries removed.
    pub dropped: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.reclaimed + self.requeued + self.dropped
    }
}

pub struct Reaper {
    queue: Arc<JobQueue>,
    visibility_timeout: Duration,
    seen_pending: Mutex<HashSet<JobId>>,
}

impl Reaper {
    pub fn new(queue: Arc<JobQueue>, visibility_timeout: Duration) -> Self {
        Self {
            queue,
            visibility_timeout,
            seen_pending: Mutex::new(HashSet::new()),
        }
    }

    /// Sweeps the processing list once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReapReport, QueueError> {
        let mut report = ReapReport::default();
        let mut still_pending = HashSet::new();
        let mut seen_pending = self.seen_pending.lock().await;
        let visibility = chrono::Duration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        for id in self.queue.processing_ids().await? {
            let job = match self.queue.get_job(&id).await? {
                Some(job) => job,
                None => {
                    debug!(job_id = %id, "Dropping processing entry with no record");
                    self.queue.drop_claim(&id).await?;
                    report.dropped += 1;
                    continue;
                }
            };

            match job.status {
                JobStatus::Processing => {
                    let started = job.started_at.unwrap_or(job.created_at);
                    if started + visibility >= now {
                        continue;
                    }
                    warn!(
                        job_id = %id,
                        name = %job.name,
                        started_at = %started,
                        "Reclaiming job past its visibility timeout"
                    );
                    self.queue
                        .fail(
                            job,
                            &JobError::HandlerFailure(VISIBILITY_TIMEOUT_ERROR.to_string()),
                            None,
                            Duration::ZERO,
                        )
                        .await?;
                    report.reclaimed += 1;
                }
                JobStatus::Pending => {
                    if seen_pending.contains(&id) {
                        warn!(job_id = %id, name = %job.name, "Requeueing job claimed but never started");
                        self.queue.release(&job).await?;
                        report.requeued += 1;
                    } else {
                        still_pending.insert(id);
                    }
                }
                JobStatus::Scheduled | JobStatus::Completed | JobStatus::Failed => {
                    debug!(job_id = %id, status = %job.status, "Dropping settled processing entry");
                    self.queue.drop_claim(&id).await?;
                    report.dropped += 1;
                }
            }
        }

        *seen_pending = still_pending;
        Ok(report)
    }
}
