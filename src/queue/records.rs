//! Job record store.
//!
//! Each job lives in a hash at `{prefix}:job:{id}` with two fields: `data`
//! (the JSON wire form) and `status`. A per-status set indexes job ids so
//! jobs can be listed by status without scanning the keyspace.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::keys::KeySpace;
use crate::store::{Store, StoreError};

use super::job::{Job, JobId, JobStatus};
use super::job_queue::QueueError;

const DATA_FIELD: &str = "data";
const STATUS_FIELD: &str = "status";

#[derive(Clone)]
pub struct JobRecords {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl JobRecords {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Writes `job` and moves its id between status index sets.
    ///
    /// `previous` is the status the stored record had before this write, or
    /// `None` for a brand new record.
    pub async fn save(&self, job: &Job, previous: Option<JobStatus>) -> Result<(), QueueError> {
        let data = serde_json::to_string(job)?;
        self.store
            .hash_set(
                &self.keys.job(&job.id),
                &[
                    (DATA_FIELD, data),
                    (STATUS_FIELD, job.status.as_str().to_string()),
                ],
            )
            .await?;

        if previous != Some(job.status) {
            if let Some(previous) = previous {
                self.store
                    .set_remove(&self.keys.status_index(previous), job.id.as_str())
                    .await?;
            }
            self.store
                .set_add(&self.keys.status_index(job.status), job.id.as_str())
                .await?;
        }
        Ok(())
    }

    /// Loads a job record, `None` if it does not exist or has expired.
    pub async fn load(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let key = self.keys.job(id);
        let Some(fields) = self.store.hash_get(&key).await? else {
            return Ok(None);
        };
        let data = fields.get(DATA_FIELD).ok_or_else(|| StoreError::Corrupt {
            key: key.clone(),
            message: format!("missing '{DATA_FIELD}' field"),
        })?;
        Ok(Some(serde_json::from_str(data)?))
    }

    /// Bounds the lifetime of a settled record.
    pub async fn expire(&self, id: &JobId, ttl: Duration) -> Result<(), QueueError> {
        self.store.expire(&self.keys.job(id), ttl).await?;
        Ok(())
    }

    /// Makes a record permanent again.
    pub async fn persist(&self, id: &JobId) -> Result<(), QueueError> {
        self.store.persist(&self.keys.job(id)).await?;
        Ok(())
    }

    /// Lists jobs currently in `status`, at most `limit` of them.
    ///
    /// Index entries whose record has expired are pruned on the way; entries
    /// whose record moved on to another status are skipped.
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let index = self.keys.status_index(status);
        let mut ids = self.store.set_members(&index).await?;
        ids.sort();

        let mut jobs = Vec::new();
        for id in ids {
            if jobs.len() >= limit {
                break;
            }
            let id = JobId::from(id);
            match self.load(&id).await? {
                Some(job) if job.status == status => jobs.push(job),
                Some(_) => {}
                None => {
                    debug!(job_id = %id, status = %status, "Pruning expired job from status index");
                    self.store.set_remove(&index, id.as_str()).await?;
                }
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
