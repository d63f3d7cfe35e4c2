//! Worker pool for processing jobs from the priority queues.
//!
//! Each worker runs as an independent async task: it claims a job for its
//! pool's routes, runs the registered handler under a hard deadline and
//! records the outcome through `JobQueue`.
//!
//! # Features
//!
//! - Configurable number of workers and served routes
//! - Handlers run in their own task, so panics become job failures
//! - Hard timeout with cooperative cancellation
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::keys::DEFAULT_ROUTE;
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::queue::{FailureOutcome, Job, JobId, JobQueue, QueueError};
use crate::store::StoreBackoff;

use super::registry::{HandlerRegistry, JobContext};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Routes this pool claims jobs from, in preference order.
    pub routing_keys: Vec<String>,
    /// Longest a single claim blocks waiting for work.
    pub dequeue_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Backoff for store failures while claiming or recording outcomes.
    pub store_backoff: StoreBackoff,
    /// Reaper visibility timeout. Every handler deadline must stay below it,
    /// or a still-running job would be reclaimed and run twice.
    pub visibility_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            routing_keys: vec![DEFAULT_ROUTE.to_string()],
            dequeue_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            store_backoff: StoreBackoff::default(),
            visibility_timeout: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the routes served by the pool.
    pub fn with_routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_store_backoff(mut self, backoff: StoreBackoff) -> Self {
        self.store_backoff = backoff;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Executions that succeeded.
    pub jobs_completed: u64,
    /// Executions that failed, whether retried or dead-lettered.
    pub jobs_failed: u64,
    /// Jobs moved to the dead letter queue.
    pub jobs_dead_lettered: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_dead_letter(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over a shared queue.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            registry,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Workers begin claiming jobs immediately.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// `PoolError::InvalidConfig` if it has no workers or no routes, or if a
    /// handler deadline reaches the visibility timeout.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig("num_workers must be > 0".into()));
        }
        if self.config.routing_keys.is_empty() {
            return Err(PoolError::InvalidConfig("routing_keys must not be empty".into()));
        }
        if let Some(visibility) = self.config.visibility_timeout {
            let longest = self.registry.max_timeout();
            if longest >= visibility {
                return Err(PoolError::InvalidConfig(format!(
                    "handler timeout {longest:?} must be below visibility timeout {visibility:?}"
                )));
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                registry: Arc::clone(&self.registry),
                shutdown_rx: self.shutdown_tx.subscribe(),
                routes: self.config.routing_keys.clone(),
                dequeue_timeout: self.config.dequeue_timeout,
                store_backoff: self.config.store_backoff,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            routes = ?self.config.routing_keys,
            handlers = ?self.registry.names(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal to all workers and waits for them to finish
    /// their current jobs.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles = &mut self.worker_handles;
        let shutdown_future = async {
            while let Some(handle) = handles.last_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
                handles.pop();
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                // Stragglers are aborted; their claims are left to the reaper
                let stragglers = self.worker_handles.len();
                for handle in self.worker_handles.drain(..) {
                    handle.abort();
                }
                warn!(stragglers, "Worker pool shutdown timed out, aborted remaining workers");
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns a reference to the job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    routes: Vec<String>,
    dequeue_timeout: Duration,
    store_backoff: StoreBackoff,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Claims and processes jobs until a shutdown signal is received. A job
    /// in flight always runs to its outcome before the worker stops.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        let mut store_failures = 0u32;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.claim(&self.routes, self.dequeue_timeout).await {
                Ok(Some(job)) => {
                    store_failures = 0;
                    self.process_job(job).await;
                }
                Ok(None) => {
                    store_failures = 0;
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    store_failures = store_failures.saturating_add(1);
                    let delay = self.store_backoff.delay(store_failures);
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to claim job"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs a claimed job and records its outcome.
    async fn process_job(&self, job: Job) {
        let job_id = job.id.clone();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            name = %job.name,
            attempt = job.attempts + 1,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let start_time = Instant::now();

        let result = self.execute_job_with_timeout(&job).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        match result {
            Ok(output) => {
                self.stats.record_completion(duration);
                self.metrics
                    .record_job(JobOutcome::Completed, &job.name, duration);

                let recorded = self
                    .settle("complete", &job_id, || {
                        self.queue
                            .complete(job.clone(), output.clone(), &self.id, duration)
                    })
                    .await;
                if recorded == Some(true) {
                    info!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed successfully"
                    );
                }
            }
            Err(job_error) => {
                self.stats.record_failure(duration);

                let outcome = self
                    .settle("fail", &job_id, || {
                        self.queue
                            .fail(job.clone(), &job_error, Some(self.id.as_str()), duration)
                    })
                    .await;

                match outcome {
                    Some(FailureOutcome::Retrying { at }) => {
                        self.metrics.record_job(JobOutcome::Retried, &job.name, duration);
                        warn!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %job_error,
                            attempt = job.attempts + 1,
                            retry_at = %at,
                            "Job failed, scheduled for retry"
                        );
                    }
                    Some(FailureOutcome::DeadLettered) => {
                        self.stats.record_dead_letter();
                        self.metrics
                            .record_job(JobOutcome::DeadLettered, &job.name, duration);
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %job_error,
                            "Job failed, moved to dead letter queue"
                        );
                    }
                    Some(FailureOutcome::Discarded) | None => {}
                }
            }
        }
    }

    /// Executes a job's handler under its deadline.
    ///
    /// The handler runs in its own task. On timeout its cancellation token is
    /// cancelled and the task aborted, so a handler that ignores the token
    /// still cannot hold the worker. The task is also aborted if the worker
    /// itself is.
    async fn execute_job_with_timeout(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let registered = self
            .registry
            .get(&job.name)
            .ok_or_else(|| JobError::HandlerNotFound(job.name.clone()))?;

        let cancel = CancellationToken::new();
        let ctx = JobContext::new(job.clone(), cancel.clone());
        let handler = registered.handler;
        let task = tokio::spawn(async move { handler.handle(ctx).await });
        let mut task = AbortOnDropHandle::new(task);

        match tokio::time::timeout(registered.timeout, &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(JobError::HandlerFailure(format!("{e:#}"))),
            Ok(Err(join_error)) => Err(JobError::HandlerFailure(panic_message(join_error))),
            Err(_) => {
                cancel.cancel();
                task.abort();
                Err(JobError::HandlerTimeout(registered.timeout))
            }
        }
    }

    /// Records a job outcome, retrying transient store failures.
    ///
    /// Store failures here never consume the job's retry budget. If they
    /// persist, the job stays in the processing list for the reaper.
    async fn settle<T, F, Fut>(&self, operation: &str, job_id: &JobId, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) if e.is_retryable() && failures + 1 < self.store_backoff.max_attempts => {
                    failures += 1;
                    let delay = self.store_backoff.delay(failures);
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        operation,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to record job outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        operation,
                        error = %e,
                        "Failed to record job outcome"
                    );
                    return None;
                }
            }
        }
    }
}

/// Turns a failed handler task into an error message.
fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return format!("Handler task aborted: {join_error}");
    }
    let payload = join_error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Handler panicked: {s}")
    } else {
        "Handler panicked".to_string()
    }
}
