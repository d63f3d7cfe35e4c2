//! Prometheus metrics registration.
//!
//! This module defines all Prometheus metrics used by bananas. The registry is
//! exposed so an outer HTTP layer can gather and serve it.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all bananas metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of job executions, labeled by outcome and handler name.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution duration in seconds, labeled by handler name.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs waiting, labeled by queue (`route:priority`, `scheduled`,
/// `processing`, `dead_letter`).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Scheduler ticks, labeled by outcome (`ran`, `skipped`, `error`).
pub static SCHEDULER_TICKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduled jobs promoted into priority queues.
pub static JOBS_PROMOTED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Processing entries reclaimed by the reaper.
pub static JOBS_RECLAIMED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("bananas_jobs_total", "Total number of job executions"),
        &["status", "handler"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "bananas_job_duration_seconds",
            "Handler execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["handler"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("bananas_queue_depth", "Number of jobs in queue"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "bananas_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("bananas_active_workers", "Number of running workers")?;

    // Scheduler metrics
    let scheduler_ticks = CounterVec::new(
        Opts::new("bananas_scheduler_ticks_total", "Scheduler ticks by outcome"),
        &["outcome"],
    )?;

    let jobs_promoted = IntCounter::new(
        "bananas_jobs_promoted_total",
        "Scheduled jobs promoted into priority queues",
    )?;

    let jobs_reclaimed = IntCounter::new(
        "bananas_jobs_reclaimed_total",
        "Processing entries reclaimed by the reaper",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(scheduler_ticks.clone()))?;
    registry.register(Box::new(jobs_promoted.clone()))?;
    registry.register(Box::new(jobs_reclaimed.clone()))?;

    // If any of these fail, metrics were initialized concurrently
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SCHEDULER_TICKS_TOTAL.set(scheduler_ticks);
    let _ = JOBS_PROMOTED_TOTAL.set(jobs_promoted);
    let _ = JOBS_RECLAIMED_TOTAL.set(jobs_reclaimed);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Returns the registry, if `init_metrics` has run.
pub fn registry() -> Option<&'static Registry> {
    REGISTRY.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(registry().is_some());
    }

    #[test]
    fn test_registry_gathers_job_metrics() {
        init_metrics().unwrap();
        JOBS_TOTAL
            .get()
            .unwrap()
            .with_label_values(&["completed", "registry_test"])
            .inc();

        let families = registry().unwrap().gather();
        assert!(!families.is_empty());
        assert!(
            JOBS_TOTAL
                .get()
                .unwrap()
                .with_label_values(&["completed", "registry_test"])
                .get()
                >= 1.0
        );
    }
}
