//! Result backend.
//!
//! Stores job outcomes under `{prefix}:result:{id}` with a TTL chosen by
//! outcome (success and failure TTLs are independent) and publishes each
//! outcome on `{prefix}:results:{id}` so callers can wait without polling.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::keys::KeySpace;
use crate::queue::{JobId, JobResult, ResultStatus};
use crate::store::{Store, StoreError};

/// Default lifetime of a successful result.
pub const DEFAULT_SUCCESS_TTL: Duration = Duration::from_secs(60 * 60);

/// Default lifetime of a failed result.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DATA_FIELD: &str = "data";
const STATUS_FIELD: &str = "status";

/// Errors returned by the result backend.
#[derive(Debug, Error)]
pub enum ResultError {
    /// No result exists for the job, or it has expired.
    #[error("Result for job {0} not found")]
    NotFound(JobId),

    /// No result arrived within the wait budget.
    #[error("Timed out after {0:?} waiting for result")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct ResultBackend {
    store: Arc<dyn Store>,
    keys: KeySpace,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl ResultBackend {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            success_ttl: DEFAULT_SUCCESS_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
        }
    }

    pub fn with_ttls(mut self, success_ttl: Duration, failure_ttl: Duration) -> Self {
        self.success_ttl = success_ttl;
        self.failure_ttl = failure_ttl;
        self
    }

    /// TTL applied to results with `status`.
    pub fn ttl_for(&self, status: ResultStatus) -> Duration {
        match status {
            ResultStatus::Completed => self.success_ttl,
            ResultStatus::Failed => self.failure_ttl,
        }
    }

    /// Writes `result` with its TTL and notifies waiters.
    pub async fn store(&self, result: &JobResult) -> Result<(), ResultError> {
        let key = self.keys.result(&result.job_id);
        let data = serde_json::to_string(result)?;

        self.store
            .hash_set(
                &key,
                &[
                    (DATA_FIELD, data.clone()),
                    (STATUS_FIELD, result.status.to_string()),
                ],
            )
            .await?;
        self.store.expire(&key, self.ttl_for(result.status)).await?;
        self.store
            .publish(&self.keys.result_channel(&result.job_id), &data)
            .await?;

        debug!(job_id = %result.job_id, status = %result.status, "Stored job result");
        Ok(())
    }

    /// Removes the stored result for `id`, if any.
    pub async fn clear(&self, id: &JobId) -> Result<(), ResultError> {
        self.store.delete(&self.keys.result(id)).await?;
        Ok(())
    }

    /// Reads the result for `id` without blocking.
    pub async fn get(&self, id: &JobId) -> Result<JobResult, ResultError> {
        let key = self.keys.result(id);
        let fields = self
            .store
            .hash_get(&key)
            .await?
            .ok_or_else(|| ResultError::NotFound(id.clone()))?;
        let data = fields.get(DATA_FIELD).ok_or_else(|| StoreError::Corrupt {
            key,
            message: format!("missing '{DATA_FIELD}' field"),
        })?;
        Ok(serde_json::from_str(data)?)
    }

    /// Waits up to `timeout` for the result of `id`.
    ///
    /// Subscribes before reading so a result stored between the read and the
    /// subscription is not missed, then falls back to a final read when the
    /// wait expires.
    pub async fn await_result(
        &self,
        id: &JobId,
        timeout: Duration,
    ) -> Result<JobResult, ResultError> {
        let mut notifications = self.store.subscribe(&self.keys.result_channel(id)).await?;

        match self.get(id).await {
            Ok(result) => return Ok(result),
            Err(ResultError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let waited = tokio::time::timeout(timeout, async {
            while let Some(message) = notifications.next().await {
                match serde_json::from_str::<JobResult>(&message) {
                    Ok(result) => return Some(result),
                    Err(e) => warn!(job_id = %id, error = %e, "Ignoring malformed result notification"),
                }
            }
            None
        })
        .await;

        match waited {
            Ok(Some(result)) => Ok(result),
            _ => match self.get(id).await {
                Ok(result) => Ok(result),
                Err(ResultError::NotFound(_)) => Err(ResultError::Timeout(timeout)),
                Err(e) => Err(e),
            },
        }
    }
}
