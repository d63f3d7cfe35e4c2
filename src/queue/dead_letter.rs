//! Dead letter queue: terminal resting place of failed jobs.
//!
//! Newest entries are at the tail. Records of dead-lettered jobs never expire,
//! so the list plus the job record together keep the full failure history.

use std::sync::Arc;

use crate::keys::KeySpace;
use crate::store::Store;

use super::job::JobId;
use super::job_queue::QueueError;

#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn push(&self, id: &JobId) -> Result<(), QueueError> {
        self.store
            .list_push_tail(&self.keys.dead_letter(), id.as_str())
            .await?;
        Ok(())
    }

    /// Returns up to `limit` ids, oldest first, without removing them.
    pub async fn peek(&self, limit: usize) -> Result<Vec<JobId>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .store
            .list_range(&self.keys.dead_letter(), 0, limit as isize - 1)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    /// Removes `id`. Returns whether it was present.
    pub async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        let removed = self
            .store
            .list_remove(&self.keys.dead_letter(), id.as_str())
            .await?;
        Ok(removed > 0)
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.list_len(&self.keys.dead_letter()).await?)
    }
}
