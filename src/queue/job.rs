//! Job definitions.
//!
//! This module defines the core job types used throughout the queue:
//!
//! - `Job`: A unit of work routed to a named handler
//! - `Priority`: Dispatch priority (`high > normal > low`)
//! - `JobStatus`: Lifecycle state of a job
//! - `JobResult`: Outcome of a job execution, kept by the result backend
//!
//! Field names of the serialized `Job` are the wire contract shared with any
//! HTTP or CLI binding: `id, name, payload, status, priority, routingKey,
//! description, attempts, maxRetries, error, createdAt, scheduledFor,
//! completedAt`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::DEFAULT_ROUTE;

/// Default retry budget for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Opaque unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Error returned when parsing an enum from its wire name fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Dispatch priority of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(ParseEnumError {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a job. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a priority queue.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Waiting in the scheduled set for its due time.
    Scheduled,
    /// Handler succeeded.
    Completed,
    /// Dead-lettered after exhausting retries or a non-retryable error.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Scheduled,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// A unit of work to be executed by the handler registered under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Handler name.
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: Priority,
    /// Restricts which worker pools may claim the job.
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Number of failed executions so far.
    pub attempts: u32,
    /// Number of retries allowed after the first failed execution.
    pub max_retries: u32,
    /// Last error message.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the current (or last) execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending, normal-priority job with the default retry budget.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            status: JobStatus::Pending,
            priority: Priority::Normal,
            routing_key: None,
            description: String::new(),
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            created_at: Utc::now(),
            scheduled_for: None,
            completed_at: None,
            started_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defers the job until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Route whose queues hold this job.
    pub fn route(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(DEFAULT_ROUTE)
    }

    /// Records a failed execution and its error.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.error = Some(error.into());
    }

    /// Returns whether another execution is allowed after the failures recorded so far.
    pub fn should_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Returns the number of retries left.
    pub fn remaining_retries(&self) -> u32 {
        (self.max_retries + 1).saturating_sub(self.attempts)
    }
}

/// Final status of a job result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Completed => write!(f, "completed"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a job, stored by the result backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub status: ResultStatus,
    /// Handler output on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// ID of the worker that produced the outcome, if any.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Duration of the last execution in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl JobResult {
    /// Creates a successful result.
    pub fn success(
        job_id: JobId,
        output: serde_json::Value,
        worker_id: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: ResultStatus::Completed,
            result: Some(output),
            error: None,
            completed_at: Utc::now(),
            worker_id: Some(worker_id.into()),
            duration_ms,
        }
    }

    /// Creates a failed result.
    pub fn failure(
        job_id: JobId,
        error: impl Into<String>,
        worker_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: ResultStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            worker_id,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}
