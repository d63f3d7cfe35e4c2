//! The retry/scheduler tick loop.
//!
//! Every tick:
//!
//! 1. Cron schedules are evaluated (no lease needed, fires are deduplicated
//!    per schedule and fire time).
//! 2. The scheduler lease is taken. If another instance holds it, the tick
//!    is skipped.
//! 3. Due scheduled jobs are promoted into their priority queues in batches
//!    until none are left.
//! 4. Every `reap_interval` the processing list is swept by the `Reaper`.
//! 5. The lease is released. If the process dies mid-tick the lease TTL
//!    bounds how long other instances stay locked out.
//!
//! A crash between popping a due id from the scheduled set and pushing it to
//! its queue loses that promotion; the job record stays `scheduled`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::keys::KeySpace;
use crate::metrics::MetricsCollector;
use crate::queue::JobQueue;
use crate::store::{Store, StoreBackoff};

use super::cron::CronScheduler;
use super::lease::Lease;
use super::reaper::{ReapReport, Reaper, DEFAULT_VISIBILITY_TIMEOUT};
use super::SchedulerError;

/// Name of the lease key guarding promotion.
pub const SCHEDULER_LOCK: &str = "scheduler";

/// Configuration for the tick loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Lease TTL. Must exceed the expected tick duration.
    pub lock_ttl: Duration,
    /// Largest number of due jobs promoted per store round trip.
    pub promote_batch: usize,
    /// Time between processing-list sweeps.
    pub reap_interval: Duration,
    /// Age after which a `processing` job is presumed abandoned.
    pub visibility_timeout: Duration,
    /// Backoff applied when a tick fails on the store.
    pub store_backoff: StoreBackoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(5),
            promote_batch: 100,
            reap_interval: Duration::from_secs(30),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            store_backoff: StoreBackoff::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_promote_batch(mut self, batch: usize) -> Self {
        self.promote_batch = batch;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance holds the lease.
    Skipped,
    /// Promotion ran under the lease.
    Ran {
        promoted: usize,
        /// Present when the reaper swept on this tick.
        reaped: Option<ReapReport>,
    },
}

pub struct RetryScheduler {
    queue: Arc<JobQueue>,
    lease: Lease,
    reaper: Reaper,
    cron: Option<CronScheduler>,
    config: SchedulerConfig,
    last_reap: Mutex<Option<DateTime<Utc>>>,
    metrics: MetricsCollector,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn Store>,
        keys: &KeySpace,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lease: Lease::new(store, keys.lock(SCHEDULER_LOCK), config.lock_ttl),
            reaper: Reaper::new(queue.clone(), config.visibility_timeout),
            queue,
            cron: None,
            config,
            last_reap: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Evaluates `cron` on every tick.
    pub fn with_cron(mut self, cron: CronScheduler) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs one tick as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, SchedulerError> {
        if let Some(cron) = &self.cron {
            if let Err(e) = cron.evaluate(now).await {
                warn!(error = %e, "Cron evaluation failed");
            }
        }

        if !self.lease.try_acquire().await? {
            debug!("Scheduler lease held elsewhere, skipping tick");
            self.metrics.record_tick("skipped", 0, 0);
            return Ok(TickOutcome::Skipped);
        }

        let outcome = self.run_locked(now).await;

        if let Err(e) = self.lease.release().await {
            warn!(error = %e, "Failed to release scheduler lease, it will expire");
        }

        match &outcome {
            Ok(TickOutcome::Ran { promoted, reaped }) => {
                let reclaimed = reaped.map(|r| r.total()).unwrap_or(0);
                self.metrics.record_tick("ran", *promoted, reclaimed);
            }
            Ok(TickOutcome::Skipped) => {}
            Err(_) => self.metrics.record_tick("error", 0, 0),
        }
        outcome
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> Result<TickOutcome, SchedulerError> {
        let batch = self.config.promote_batch.max(1);
        let mut promoted = 0;
        loop {
            let ids = self.queue.promote_due(now, batch).await?;
            promoted += ids.len();
            if ids.len() < batch {
                break;
            }
        }
        if promoted > 0 {
            info!(promoted, "Promoted due jobs");
        }

        let reaped = if self.reap_due(now).await {
            let report = self.reaper.sweep(now).await?;
            if report.total() > 0 {
                info!(
                    reclaimed = report.reclaimed,
                    requeued = report.requeued,
                    dropped = report.dropped,
                    "Reaped processing list"
                );
            }
            Some(report)
        } else {
            None
        };

        Ok(TickOutcome::Ran { promoted, reaped })
    }

    async fn reap_due(&self, now: DateTime<Utc>) -> bool {
        let mut last_reap = self.last_reap.lock().await;
        let interval = chrono::Duration::from_std(self.config.reap_interval)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        match *last_reap {
            Some(last) if last + interval > now => false,
            _ => {
                *last_reap = Some(now);
                true
            }
        }
    }

    /// Ticks every `tick_interval` until `shutdown` is cancelled.
    ///
    /// Store failures never stop the loop: retryable ones back off before
    /// the next tick, others are logged.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            lock_ttl_ms = self.config.lock_ttl.as_millis() as u64,
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(Utc::now()).await {
                Ok(_) => failures = 0,
                Err(e) if e.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.store_backoff.delay(failures);
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduler tick failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }
        }

        info!("Scheduler stopped");
    }
}
