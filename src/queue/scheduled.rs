//! Scheduled set: job ids ordered by the time they become eligible to run.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::keys::KeySpace;
use crate::store::Store;

use super::job::JobId;
use super::job_queue::QueueError;

#[derive(Clone)]
pub struct ScheduledSet {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl ScheduledSet {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Schedules `id` to become due at `at`.
    pub async fn add(&self, id: &JobId, at: DateTime<Utc>) -> Result<(), QueueError> {
        self.store
            .sorted_set_add(&self.keys.scheduled(), at.timestamp_millis() as f64, id.as_str())
            .await?;
        Ok(())
    }

    /// Atomically removes and returns up to `limit` ids due at or before `now`.
    pub async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, QueueError> {
        let ids = self
            .store
            .sorted_set_pop_range_by_score(
                &self.keys.scheduled(),
                now.timestamp_millis() as f64,
                limit,
            )
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.sorted_set_len(&self.keys.scheduled()).await?)
    }
}
