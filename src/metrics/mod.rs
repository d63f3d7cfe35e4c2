//! Metrics module for Prometheus-based monitoring.
//!
//! Records job outcomes, execution durations, queue depths and scheduler
//! activity. Serving the registry over HTTP is left to the embedding
//! application.
//!
//! # Example
//!
//! ```ignore
//! use bananas::metrics::{init_metrics, JobOutcome, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_job(JobOutcome::Completed, "send_email", duration);
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{init_metrics, registry};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_PROMOTED_TOTAL, JOBS_RECLAIMED_TOTAL, JOBS_TOTAL,
    JOB_DURATION, QUEUE_DEPTH, REGISTRY, SCHEDULER_TICKS_TOTAL,
};
