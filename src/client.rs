//! Producer-facing API.
//!
//! `Client` wraps a [`JobQueue`] with the submission and lookup operations
//! producers need. It holds no state of its own beyond the default retry
//! budget, so any number of clients may share one queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use bananas::client::Client;
//! use bananas::queue::Priority;
//! use serde_json::json;
//!
//! let client = Client::new(queue);
//! let id = client
//!     .submit_job("send_email", json!({"to": "a@example.com"}), Priority::High, "welcome mail")
//!     .await?;
//! let job = client.get_job(&id).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::queue::{
    Job, JobId, JobQueue, JobResult, JobStatus, Priority, QueueDepths, QueueError,
    DEFAULT_MAX_RETRIES,
};
use crate::results::ResultError;

/// Errors returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Result(#[from] ResultError),

    /// No result arrived while waiting. The job itself is unaffected and may
    /// still complete later.
    #[error("No result for job {id} within {timeout:?}")]
    SubmitTimeout { id: JobId, timeout: Duration },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),
}

/// Full description of a job to submit.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub description: String,
    pub routing_key: Option<String>,
    /// Falls back to the client's default when unset.
    pub max_retries: Option<u32>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: Priority::Normal,
            description: String::new(),
            routing_key: None,
            max_retries: None,
            scheduled_for: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    fn into_job(self, default_max_retries: u32) -> Job {
        let mut job = Job::new(self.name, self.payload)
            .with_priority(self.priority)
            .with_description(self.description)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries));
        if let Some(route) = self.routing_key {
            job = job.with_routing_key(route);
        }
        if let Some(at) = self.scheduled_for {
            job = job.scheduled_for(at);
        }
        job
    }
}

#[derive(Clone)]
pub struct Client {
    queue: Arc<JobQueue>,
    default_max_retries: u32,
}

impl Client {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the retry budget given to jobs whose spec leaves it unset.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Submits a job for immediate execution on the default route.
    pub async fn submit_job(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        description: impl Into<String>,
    ) -> Result<JobId, ClientError> {
        self.submit(
            JobSpec::new(name, payload)
                .with_priority(priority)
                .with_description(description),
        )
        .await
    }

    /// Submits a job that only pools serving `routing_key` may claim.
    pub async fn submit_job_with_route(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        description: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<JobId, ClientError> {
        self.submit(
            JobSpec::new(name, payload)
                .with_priority(priority)
                .with_description(description)
                .with_routing_key(routing_key),
        )
        .await
    }

    /// Submits a job that becomes eligible at `scheduled_for`.
    ///
    /// A timestamp that is not in the future enqueues the job immediately.
    pub async fn submit_job_scheduled(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        description: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> Result<JobId, ClientError> {
        self.submit(
            JobSpec::new(name, payload)
                .with_priority(priority)
                .with_description(description)
                .scheduled_for(scheduled_for),
        )
        .await
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, ClientError> {
        let job = spec.into_job(self.default_max_retries);
        let name = job.name.clone();
        let id = self.queue.submit(job).await?;
        info!(job_id = %id, name = %name, "Job submitted");
        Ok(id)
    }

    /// Submits a job and waits up to `timeout` for its outcome.
    ///
    /// A job that ran and failed terminally is returned as a failed
    /// [`JobResult`]; only the absence of any result within `timeout` is
    /// reported as [`ClientError::SubmitTimeout`].
    pub async fn submit_and_wait(
        &self,
        spec: JobSpec,
        timeout: Duration,
    ) -> Result<JobResult, ClientError> {
        let id = self.submit(spec).await?;
        match self.queue.results().await_result(&id, timeout).await {
            Ok(result) => Ok(result),
            Err(ResultError::Timeout(_)) => {
                debug!(job_id = %id, ?timeout, "Gave up waiting for job result");
                Err(ClientError::SubmitTimeout { id, timeout })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job, ClientError> {
        self.queue
            .get_job(id)
            .await?
            .ok_or_else(|| ClientError::JobNotFound(id.clone()))
    }

    pub async fn get_result(&self, id: &JobId) -> Result<JobResult, ClientError> {
        Ok(self.queue.results().get(id).await?)
    }

    pub async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, ClientError> {
        Ok(self.queue.list_jobs_by_status(status, limit).await?)
    }

    pub async fn queue_depths(&self) -> Result<QueueDepths, ClientError> {
        Ok(self.queue.depths().await?)
    }

    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<Job>, ClientError> {
        Ok(self.queue.peek_dead_letter(limit).await?)
    }

    /// Moves a dead-lettered job back to pending with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &JobId) -> Result<Job, ClientError> {
        match self.queue.requeue_dead_letter(id).await {
            Ok(job) => Ok(job),
            Err(QueueError::JobNotFound(id)) => Err(ClientError::JobNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
