//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run, so
//! library users that never initialize metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_PROMOTED_TOTAL, JOBS_RECLAIMED_TOTAL, JOBS_TOTAL,
    JOB_DURATION, QUEUE_DEPTH, SCHEDULER_TICKS_TOTAL,
};
use crate::queue::QueueDepths;

/// Outcome label for a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    DeadLettered,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried => "retried",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for recording bananas operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one handler execution.
    ///
    /// # Arguments
    ///
    /// * `outcome` - What happened to the job afterwards
    /// * `handler` - Job name the handler is registered under
    /// * `duration` - Wall-clock execution time
    pub fn record_job(&self, outcome: JobOutcome, handler: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[outcome.as_str(), handler])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[handler])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            status = outcome.as_str(),
            handler = handler,
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Update the depth gauge of a single queue.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
    }

    /// Update every depth gauge from a snapshot.
    pub fn update_queue_depths(&self, depths: &QueueDepths) {
        for q in &depths.queues {
            self.update_queue_depth(&format!("{}:{}", q.route, q.priority), q.depth);
        }
        self.update_queue_depth("processing", depths.processing);
        self.update_queue_depth("scheduled", depths.scheduled);
        self.update_queue_depth("dead_letter", depths.dead_letter);

        tracing::trace!(
            pending = depths.pending(),
            processing = depths.processing,
            scheduled = depths.scheduled,
            dead_letter = depths.dead_letter,
            "Updated queue depth metrics"
        );
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }

    /// Record a scheduler tick and what it did.
    pub fn record_tick(&self, outcome: &str, promoted: usize, reclaimed: usize) {
        if let Some(ticks) = SCHEDULER_TICKS_TOTAL.get() {
            ticks.with_label_values(&[outcome]).inc();
        }
        if let Some(counter) = JOBS_PROMOTED_TOTAL.get() {
            counter.inc_by(promoted as u64);
        }
        if let Some(counter) = JOBS_RECLAIMED_TOTAL.get() {
            counter.inc_by(reclaimed as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;
    use crate::queue::{Priority, QueueDepth};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(JobOutcome::Completed.as_str(), "completed");
        assert_eq!(JobOutcome::Retried.as_str(), "retried");
        assert_eq!(JobOutcome::DeadLettered.as_str(), "dead_lettered");
    }

    #[test]
    fn test_record_job() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job(JobOutcome::Completed, "collector_test", Duration::from_millis(120));
        collector.record_job(JobOutcome::DeadLettered, "collector_test", Duration::from_secs(1));

        let count = JOBS_TOTAL
            .get()
            .unwrap()
            .with_label_values(&["completed", "collector_test"])
            .get();
        assert!(count >= 1.0);
    }

    #[test]
    fn test_update_queue_depths() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.update_queue_depths(&QueueDepths {
            queues: vec![QueueDepth {
                route: "collector_route".to_string(),
                priority: Priority::High,
                depth: 7,
            }],
            processing: 1,
            scheduled: 2,
            dead_letter: 3,
        });

        let gauge = QUEUE_DEPTH
            .get()
            .unwrap()
            .with_label_values(&["collector_route:high"])
            .get();
        assert_eq!(gauge, 7.0);
    }

    #[test]
    fn test_worker_and_tick_recording() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_workers(4);
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();
        collector.record_tick("ran", 3, 1);
        collector.record_tick("skipped", 0, 0);
    }
}
