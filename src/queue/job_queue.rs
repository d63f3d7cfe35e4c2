//! Store-backed job queue with reliable dequeue.
//!
//! `JobQueue` owns every job state transition and keeps the job record and
//! its queue membership consistent. A job id is in exactly one of:
//!
//! - `{prefix}:queue:{route}:{priority}`: pending, waiting for a worker
//! - `{prefix}:processing`: claimed by a worker
//! - `{prefix}:scheduled`: deferred or waiting out a retry backoff
//! - `{prefix}:dead_letter`: failed terminally
//!
//! or in none of them once completed. Each transition writes the destination
//! before removing the source, so a crash in between leaves a duplicate the
//! reaper can reconcile rather than a lost job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::keys::KeySpace;
use crate::results::{ResultBackend, ResultError};
use crate::store::{Store, StoreError};

use super::dead_letter::DeadLetterQueue;
use super::job::{Job, JobId, JobResult, JobStatus};
use super::priority::{PriorityQueues, QueueDepth};
use super::records::JobRecords;
use super::retry::RetryPolicy;
use super::scheduled::ScheduledSet;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("Result backend failed: {0}")]
    Result(#[from] ResultError),
}

impl QueueError {
    /// Returns whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Store(e) => e.is_retryable(),
            QueueError::Result(ResultError::Store(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

/// What happened to a job after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled for another attempt at the given time.
    Retrying { at: DateTime<Utc> },
    /// Moved to the dead letter queue.
    DeadLettered,
    /// The claim was lost before the failure was recorded; nothing changed.
    Discarded,
}

/// Snapshot of how many jobs sit in each structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub queues: Vec<QueueDepth>,
    pub processing: usize,
    pub scheduled: usize,
    pub dead_letter: usize,
}

impl QueueDepths {
    /// Jobs waiting in priority queues.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.depth).sum()
    }

    /// Returns the total number of jobs in all structures.
    pub fn total_jobs(&self) -> usize {
        self.pending() + self.processing + self.scheduled + self.dead_letter
    }
}

/// The queue core shared by producers, workers and the scheduler loop.
#[derive(Clone)]
pub struct JobQueue {
    records: JobRecords,
    queues: PriorityQueues,
    scheduled: ScheduledSet,
    dead_letter: DeadLetterQueue,
    results: ResultBackend,
    retry_policy: RetryPolicy,
}

impl JobQueue {
    /// Creates a queue over `store` with default TTLs, backoff and dequeue slice.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            records: JobRecords::new(store.clone(), keys.clone()),
            queues: PriorityQueues::new(store.clone(), keys.clone()),
            scheduled: ScheduledSet::new(store.clone(), keys.clone()),
            dead_letter: DeadLetterQueue::new(store.clone(), keys.clone()),
            results: ResultBackend::new(store, keys),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_result_ttls(mut self, success_ttl: Duration, failure_ttl: Duration) -> Self {
        self.results = self.results.with_ttls(success_ttl, failure_ttl);
        self
    }

    pub fn with_dequeue_slice(mut self, slice: Duration) -> Self {
        self.queues = self.queues.with_dequeue_slice(slice);
        self
    }

    pub fn results(&self) -> &ResultBackend {
        &self.results
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Writes a new job record, then enqueues it immediately or into the
    /// scheduled set when `scheduled_for` lies in the future.
    pub async fn submit(&self, mut job: Job) -> Result<JobId, QueueError> {
        let now = Utc::now();
        job.attempts = 0;
        job.error = None;
        job.completed_at = None;
        job.started_at = None;

        match job.scheduled_for {
            Some(at) if at > now => {
                job.status = JobStatus::Scheduled;
                self.records.save(&job, None).await?;
                self.scheduled.add(&job.id, at).await?;
                debug!(job_id = %job.id, name = %job.name, scheduled_for = %at, "Job scheduled");
            }
            _ => {
                job.status = JobStatus::Pending;
                job.scheduled_for = None;
                self.records.save(&job, None).await?;
                self.queues.push(&job).await?;
                debug!(
                    job_id = %job.id,
                    name = %job.name,
                    priority = %job.priority,
                    route = job.route(),
                    "Job enqueued"
                );
            }
        }
        Ok(job.id)
    }

    /// Claims the next job for `routes`, blocking up to `timeout`.
    ///
    /// The returned job is marked `processing` with `started_at` set. Stale
    /// ids (expired records, or records that already moved on) are dropped
    /// from the processing list and reported as no job.
    pub async fn claim(
        &self,
        routes: &[String],
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let Some(id) = self.queues.dequeue(routes, timeout).await? else {
            return Ok(None);
        };

        let Some(mut job) = self.records.load(&id).await? else {
            warn!(job_id = %id, "Dropping claimed id with no job record");
            self.queues.ack(&id).await?;
            return Ok(None);
        };

        if job.status != JobStatus::Pending {
            warn!(job_id = %id, status = %job.status, "Dropping claimed id for non-pending job");
            self.queues.ack(&id).await?;
            return Ok(None);
        }

        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        self.records.save(&job, Some(JobStatus::Pending)).await?;
        Ok(Some(job))
    }

    /// Records a successful execution: result, record TTL, processing ack.
    ///
    /// Returns `false` without writing anything when the claim `job` came
    /// from was lost, e.g. the reaper already charged it and the job moved on.
    pub async fn complete(
        &self,
        mut job: Job,
        output: serde_json::Value,
        worker_id: &str,
        duration: Duration,
    ) -> Result<bool, QueueError> {
        if !self.holds_claim(&job).await? {
            warn!(job_id = %job.id, worker_id, "Discarding result of a lost claim");
            return Ok(false);
        }
        let previous = job.status;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.error = None;
        self.records.save(&job, Some(previous)).await?;

        let result = JobResult::success(
            job.id.clone(),
            output,
            worker_id,
            duration.as_millis() as u64,
        );
        self.results.store(&result).await?;
        self.records
            .expire(&job.id, self.results.ttl_for(result.status))
            .await?;
        self.queues.ack(&job.id).await?;
        Ok(true)
    }

    /// Records a failed execution and routes the job to a retry or the
    /// dead letter queue.
    ///
    /// Retryable errors consume an attempt; the job is rescheduled with
    /// exponential backoff while attempts remain. `HandlerNotFound` goes
    /// straight to the dead letter queue without consuming an attempt.
    pub async fn fail(
        &self,
        mut job: Job,
        error: &JobError,
        worker_id: Option<&str>,
        duration: Duration,
    ) -> Result<FailureOutcome, QueueError> {
        if !self.holds_claim(&job).await? {
            warn!(job_id = %job.id, error = %error, "Discarding failure of a lost claim");
            return Ok(FailureOutcome::Discarded);
        }
        let previous = job.status;
        let message = error.to_string();

        if error.is_retryable() {
            job.record_failure(&message);
            if job.should_retry() {
                let at = self.retry_policy.next_run_at(Utc::now(), job.attempts);
                job.status = JobStatus::Scheduled;
                job.scheduled_for = Some(at);
                self.records.save(&job, Some(previous)).await?;
                self.scheduled.add(&job.id, at).await?;
                self.queues.ack(&job.id).await?;
                return Ok(FailureOutcome::Retrying { at });
            }
        } else {
            job.error = Some(message.clone());
        }

        self.bury(job, previous, message, worker_id, duration).await?;
        Ok(FailureOutcome::DeadLettered)
    }

    /// Whether the stored record still belongs to the claim `job` was taken
    /// from. Jobs that were not claimed always pass.
    async fn holds_claim(&self, job: &Job) -> Result<bool, QueueError> {
        if job.status != JobStatus::Processing {
            return Ok(true);
        }
        let current = self.records.load(&job.id).await?;
        Ok(current.is_some_and(|current| {
            current.status == JobStatus::Processing && current.started_at == job.started_at
        }))
    }

    /// Moves a job to the dead letter queue and publishes its failure.
    async fn bury(
        &self,
        mut job: Job,
        previous: JobStatus,
        message: String,
        worker_id: Option<&str>,
        duration: Duration,
    ) -> Result<(), QueueError> {
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        self.records.save(&job, Some(previous)).await?;
        self.records.persist(&job.id).await?;
        self.dead_letter.push(&job.id).await?;

        let result = JobResult::failure(
            job.id.clone(),
            message,
            worker_id.map(str::to_string),
            duration.as_millis() as u64,
        );
        self.results.store(&result).await?;
        self.queues.ack(&job.id).await?;
        info!(job_id = %job.id, name = %job.name, attempts = job.attempts, "Job moved to dead letter queue");
        Ok(())
    }

    /// Promotes up to `limit` scheduled jobs due at or before `now` into
    /// their priority queues. Returns the promoted ids.
    pub async fn promote_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, QueueError> {
        let due = self.scheduled.pop_due(now, limit).await?;
        let mut promoted = Vec::with_capacity(due.len());

        for id in due {
            let Some(mut job) = self.records.load(&id).await? else {
                warn!(job_id = %id, "Scheduled job has no record, skipping");
                continue;
            };
            if job.status != JobStatus::Scheduled {
                warn!(job_id = %id, status = %job.status, "Scheduled entry for non-scheduled job, skipping");
                continue;
            }

            job.status = JobStatus::Pending;
            job.scheduled_for = None;
            self.records.save(&job, Some(JobStatus::Scheduled)).await?;
            self.queues.push(&job).await?;
            debug!(job_id = %id, priority = %job.priority, route = job.route(), "Promoted scheduled job");
            promoted.push(id);
        }
        Ok(promoted)
    }

    /// Puts a claimed-but-never-started job back at the tail of its queue
    /// without consuming an attempt.
    pub async fn release(&self, job: &Job) -> Result<(), QueueError> {
        self.queues.push(job).await?;
        self.queues.ack(&job.id).await?;
        Ok(())
    }

    /// Drops a processing-list entry that no longer corresponds to live work.
    pub async fn drop_claim(&self, id: &JobId) -> Result<(), QueueError> {
        self.queues.ack(id).await?;
        Ok(())
    }

    /// Moves a dead-lettered job back to pending with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &JobId) -> Result<Job, QueueError> {
        let mut job = self
            .records
            .load(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                status: job.status,
                expected: JobStatus::Failed,
            });
        }
        if !self.dead_letter.remove(id).await? {
            return Err(QueueError::JobNotFound(id.clone()));
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.error = None;
        job.completed_at = None;
        job.started_at = None;
        self.records.save(&job, Some(JobStatus::Failed)).await?;
        // The failed result belongs to the previous run
        self.results.clear(id).await?;
        self.queues.push(&job).await?;
        info!(job_id = %id, "Requeued job from dead letter queue");
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.records.load(id).await
    }

    pub async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.records.list_by_status(status, limit).await
    }

    /// Dead-lettered jobs, oldest first.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        for id in self.dead_letter.peek(limit).await? {
            if let Some(job) = self.records.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn processing_ids(&self) -> Result<Vec<JobId>, QueueError> {
        self.queues.processing_ids().await
    }

    /// Returns queue depth statistics.
    pub async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let (queues, processing, scheduled, dead_letter) = tokio::try_join!(
            self.queues.depths(),
            self.queues.processing_len(),
            self.scheduled.len(),
            self.dead_letter.len(),
        )?;

        Ok(QueueDepths {
            queues,
            processing,
            scheduled,
            dead_letter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_ROUTE;
    use crate::queue::job::Priority;
    use crate::queue::ResultStatus;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryStore::new()), KeySpace::default())
            .with_dequeue_slice(Duration::from_millis(10))
    }

    fn routes() -> Vec<String> {
        vec![DEFAULT_ROUTE.to_string()]
    }

    async fn claim(queue: &JobQueue) -> Job {
        queue
            .claim(&routes(), Duration::from_millis(10))
            .await
            .unwrap()
            .expect("a job is pending")
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::JobNotFound(JobId::from("abc"));
        assert!(err.to_string().contains("not found"));

        let err = QueueError::InvalidState {
            id: JobId::from("abc"),
            status: JobStatus::Pending,
            expected: JobStatus::Failed,
        };
        assert!(err.to_string().contains("pending"));
        assert!(!err.is_retryable());
        assert!(QueueError::Store(StoreError::Unavailable("x".into())).is_retryable());
    }

    #[test]
    fn test_queue_depths_totals() {
        let depths = QueueDepths {
            queues: vec![QueueDepth {
                route: "default".to_string(),
                priority: Priority::High,
                depth: 10,
            }],
            processing: 5,
            scheduled: 3,
            dead_letter: 2,
        };
        assert_eq!(depths.pending(), 10);
        assert_eq!(depths.total_jobs(), 20);
    }

    #[tokio::test]
    async fn test_submit_claim_complete() {
        let queue = queue();
        let id = queue.submit(Job::new("echo", json!({"n": 1}))).await.unwrap();

        let job = claim(&queue).await;
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        queue
            .complete(job, json!({"n": 1}), "worker-0", Duration::from_millis(5))
            .await
            .unwrap();

        let stored = queue.get_job(&id).await.unwrap().expect("record kept until TTL");
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());

        let result = queue.results().get(&id).await.unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(queue.depths().await.unwrap().total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_future_submission_goes_to_scheduled_set() {
        let queue = queue();
        let at = Utc::now() + chrono::Duration::seconds(3600);
        let id = queue
            .submit(Job::new("later", json!(null)).scheduled_for(at))
            .await
            .unwrap();

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.scheduled, 1);
        assert_eq!(depths.pending(), 0);
        assert!(queue
            .claim(&routes(), Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        assert!(queue.promote_due(Utc::now(), 100).await.unwrap().is_empty());
        let promoted = queue
            .promote_due(at, 100)
            .await
            .unwrap();
        assert_eq!(promoted, vec![id.clone()]);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.scheduled_for.is_none());
        assert_eq!(claim(&queue).await.id, id);
    }

    #[tokio::test]
    async fn test_past_schedule_enqueues_immediately() {
        let queue = queue();
        let id = queue
            .submit(Job::new("now", json!(null)).scheduled_for(Utc::now() - chrono::Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(claim(&queue).await.id, id);
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_with_backoff() {
        let queue = queue();
        let id = queue.submit(Job::new("flaky", json!(null))).await.unwrap();
        let job = claim(&queue).await;

        let before = Utc::now();
        let outcome = queue
            .fail(
                job,
                &JobError::HandlerFailure("boom".to_string()),
                Some("worker-0"),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let FailureOutcome::Retrying { at } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        let delay = at - before;
        assert!(delay >= chrono::Duration::seconds(2));
        assert!(delay < chrono::Duration::seconds(3));

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("Handler failed: boom"));

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths.processing, 0);
        assert_eq!(depths.scheduled, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_dead_letters_without_attempt() {
        let queue = queue();
        let id = queue.submit(Job::new("unknown", json!(null))).await.unwrap();
        let job = claim(&queue).await;

        let outcome = queue
            .fail(
                job,
                &JobError::HandlerNotFound("unknown".to_string()),
                Some("worker-0"),
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);

        let result = queue.results().get(&id).await.unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.error.unwrap().contains("unknown"));

        let dead = queue.peek_dead_letter(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(queue.depths().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_resets_budget() {
        let queue = queue();
        let id = queue
            .submit(Job::new("once", json!(null)).with_max_retries(0))
            .await
            .unwrap();
        let job = claim(&queue).await;
        queue
            .fail(job, &JobError::HandlerFailure("x".into()), None, Duration::ZERO)
            .await
            .unwrap();

        let job = queue.requeue_dead_letter(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(queue.depths().await.unwrap().dead_letter, 0);
        assert_eq!(claim(&queue).await.id, id);

        let err = queue.requeue_dead_letter(&id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_clears_previous_result() {
        let queue = queue();
        let id = queue
            .submit(Job::new("once", json!(null)).with_max_retries(0))
            .await
            .unwrap();
        let job = claim(&queue).await;
        queue
            .fail(job, &JobError::HandlerFailure("x".into()), None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            queue.results().get(&id).await.unwrap().status,
            ResultStatus::Failed
        );

        queue.requeue_dead_letter(&id).await.unwrap();
        assert!(matches!(
            queue.results().get(&id).await,
            Err(ResultError::NotFound(_))
        ));
        assert!(matches!(
            queue.results().await_result(&id, Duration::from_millis(50)).await,
            Err(ResultError::Timeout(_))
        ));

        let err = queue.requeue_dead_letter(&id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_claim_drops_stale_ids() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::default();
        let queue = JobQueue::new(store.clone(), keys.clone())
            .with_dequeue_slice(Duration::from_millis(10));
        store
            .list_push_tail(&keys.queue(DEFAULT_ROUTE, Priority::Normal), "ghost")
            .await
            .unwrap();

        assert!(queue
            .claim(&routes(), Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert!(queue.processing_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_by_status() {
        let queue = queue();
        queue.submit(Job::new("a", json!(1))).await.unwrap();
        queue.submit(Job::new("a", json!(2))).await.unwrap();
        queue
            .submit(Job::new("b", json!(3)).scheduled_for(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(queue.list_jobs_by_status(JobStatus::Pending, 10).await.unwrap().len(), 2);
        assert_eq!(queue.list_jobs_by_status(JobStatus::Pending, 1).await.unwrap().len(), 1);
        assert_eq!(queue.list_jobs_by_status(JobStatus::Scheduled, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_of_lost_claim_is_discarded() {
        let queue = queue();
        let id = queue
            .submit(Job::new("slow", json!(null)).with_max_retries(3))
            .await
            .unwrap();
        let slow = claim(&queue).await;

        // The reaper charges the hung execution and the retry runs elsewhere
        queue
            .fail(
                slow.clone(),
                &JobError::HandlerFailure("visibility timeout".into()),
                None,
                Duration::ZERO,
            )
            .await
            .unwrap();
        let due = queue.get_job(&id).await.unwrap().unwrap().scheduled_for.unwrap();
        queue.promote_due(due, 10).await.unwrap();
        let retry = claim(&queue).await;
        assert_ne!(retry.started_at, slow.started_at);

        let recorded = queue
            .complete(slow.clone(), json!("late"), "worker-0", Duration::ZERO)
            .await
            .unwrap();
        assert!(!recorded);
        let outcome = queue
            .fail(slow, &JobError::HandlerFailure("late".into()), None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Discarded);

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 1);
        assert!(matches!(
            queue.results().get(&id).await,
            Err(ResultError::NotFound(_))
        ));
        assert_eq!(queue.depths().await.unwrap().processing, 1);

        assert!(queue
            .complete(retry, json!("on time"), "worker-1", Duration::ZERO)
            .await
            .unwrap());
        assert_eq!(
            queue.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
