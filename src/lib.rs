//! bananas: distributed task queue core.
//!
//! Priority queues, reliable dequeue, retries with exponential backoff,
//! scheduled and cron jobs, and a result backend, all coordinated through a
//! Redis-style store so any number of producers, worker pools and scheduler
//! instances can share one deployment.

// Core modules
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod keys;
pub mod queue;
pub mod results;
pub mod scheduler;
pub mod store;

// Ambient modules
pub mod cli;
pub mod metrics;

pub use client::{Client, ClientError, JobSpec};
pub use config::{Config, ConfigError};
pub use dispatcher::{Handler, HandlerRegistry, JobContext, WorkerPool, WorkerPoolConfig};
pub use error::JobError;
pub use queue::{Job, JobId, JobQueue, JobResult, JobStatus, Priority, QueueError};
pub use results::{ResultBackend, ResultError};
pub use scheduler::{RetryScheduler, SchedulerConfig, SchedulerError};
pub use store::{MemoryStore, RedisStore, Store, StoreError};
