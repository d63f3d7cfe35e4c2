//! Priority queue set.
//!
//! One FIFO list per `(route, priority)` pair plus a shared processing list.
//! Dequeue atomically moves an id from a queue list into the processing list,
//! so a crash between claim and execution never drops the job.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::keys::KeySpace;
use crate::store::Store;

use super::job::{Job, JobId, Priority};
use super::job_queue::QueueError;

/// Longest single blocking wait inside one dequeue call.
///
/// The blocking wait only watches the highest-priority list, so lower lists
/// are re-swept at least this often.
pub const DEFAULT_DEQUEUE_SLICE: Duration = Duration::from_secs(1);

/// Depth of one `(route, priority)` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub route: String,
    pub priority: Priority,
    pub depth: usize,
}

#[derive(Clone)]
pub struct PriorityQueues {
    store: Arc<dyn Store>,
    keys: KeySpace,
    dequeue_slice: Duration,
}

impl PriorityQueues {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            dequeue_slice: DEFAULT_DEQUEUE_SLICE,
        }
    }

    pub fn with_dequeue_slice(mut self, slice: Duration) -> Self {
        self.dequeue_slice = slice;
        self
    }

    /// Appends `job` to the tail of the list for its route and priority.
    pub async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let route = job.route();
        self.store
            .list_push_tail(&self.keys.queue(route, job.priority), job.id.as_str())
            .await?;
        self.store.set_add(&self.keys.routes(), route).await?;
        Ok(())
    }

    /// Lists to sweep for `routes`, highest priority first.
    fn sweep_order(&self, routes: &[String]) -> Vec<String> {
        Priority::ALL
            .into_iter()
            .flat_map(|priority| routes.iter().map(move |route| (route, priority)))
            .map(|(route, priority)| self.keys.queue(route, priority))
            .collect()
    }

    /// Claims the next job id for `routes`, waiting up to `timeout`.
    ///
    /// Lists are swept high > normal > low and, within a priority, in the
    /// order `routes` are given. The claimed id is atomically moved into the
    /// processing list.
    pub async fn dequeue(
        &self,
        routes: &[String],
        timeout: Duration,
    ) -> Result<Option<JobId>, QueueError> {
        let lists = self.sweep_order(routes);
        let Some(first) = lists.first() else {
            return Ok(None);
        };
        let processing = self.keys.processing();
        let deadline = Instant::now() + timeout;

        loop {
            for list in &lists {
                if let Some(id) = self.store.list_pop_head_push_tail(list, &processing).await? {
                    return Ok(Some(JobId::from(id)));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = remaining.min(self.dequeue_slice);
            if let Some(id) = self
                .store
                .list_blocking_pop_head_push_tail(first, &processing, wait)
                .await?
            {
                return Ok(Some(JobId::from(id)));
            }
        }
    }

    /// Removes `id` from the processing list once its outcome is recorded.
    pub async fn ack(&self, id: &JobId) -> Result<bool, QueueError> {
        let removed = self
            .store
            .list_remove(&self.keys.processing(), id.as_str())
            .await?;
        Ok(removed > 0)
    }

    /// Ids currently in the processing list.
    pub async fn processing_ids(&self) -> Result<Vec<JobId>, QueueError> {
        let ids = self
            .store
            .list_range(&self.keys.processing(), 0, -1)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        Ok(self.store.list_len(&self.keys.processing()).await?)
    }

    /// Depth of every known `(route, priority)` list.
    pub async fn depths(&self) -> Result<Vec<QueueDepth>, QueueError> {
        let mut routes = self.store.set_members(&self.keys.routes()).await?;
        routes.sort();

        let mut depths = Vec::with_capacity(routes.len() * Priority::ALL.len());
        for route in routes {
            for priority in Priority::ALL {
                let depth = self
                    .store
                    .list_len(&self.keys.queue(&route, priority))
                    .await?;
                depths.push(QueueDepth {
                    route: route.clone(),
                    priority,
                    depth,
                });
            }
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_ROUTE;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn queues() -> PriorityQueues {
        PriorityQueues::new(Arc::new(MemoryStore::new()), KeySpace::default())
            .with_dequeue_slice(Duration::from_millis(20))
    }

    fn default_routes() -> Vec<String> {
        vec![DEFAULT_ROUTE.to_string()]
    }

    #[tokio::test]
    async fn test_high_priority_dispatched_first() {
        let queues = queues();
        let low = Job::new("a", json!(null)).with_priority(Priority::Low);
        let normal = Job::new("b", json!(null));
        let high = Job::new("c", json!(null)).with_priority(Priority::High);
        for job in [&low, &normal, &high] {
            queues.push(job).await.unwrap();
        }

        let timeout = Duration::from_millis(10);
        let order: Vec<JobId> = [
            queues.dequeue(&default_routes(), timeout).await.unwrap(),
            queues.dequeue(&default_routes(), timeout).await.unwrap(),
            queues.dequeue(&default_routes(), timeout).await.unwrap(),
        ]
        .into_iter()
        .flatten()
        .collect();

        assert_eq!(order, vec![high.id, normal.id, low.id]);
        assert_eq!(queues.processing_len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queues = queues();
        let first = Job::new("a", json!(1));
        let second = Job::new("a", json!(2));
        queues.push(&first).await.unwrap();
        queues.push(&second).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(
            queues.dequeue(&default_routes(), timeout).await.unwrap(),
            Some(first.id)
        );
        assert_eq!(
            queues.dequeue(&default_routes(), timeout).await.unwrap(),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queues = queues();
        let started = std::time::Instant::now();
        let claimed = queues
            .dequeue(&default_routes(), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(claimed.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_routing_keys_isolate_jobs() {
        let queues = queues();
        let gpu = Job::new("render", json!(null)).with_routing_key("gpu");
        let email = Job::new("send_email", json!(null)).with_routing_key("email");
        queues.push(&gpu).await.unwrap();
        queues.push(&email).await.unwrap();

        let email_only = vec!["email".to_string()];
        let timeout = Duration::from_millis(10);
        assert_eq!(
            queues.dequeue(&email_only, timeout).await.unwrap(),
            Some(email.id)
        );
        assert_eq!(queues.dequeue(&email_only, timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_picks_up_late_lower_priority_job() {
        let queues = queues();
        let producer = {
            let queues = queues.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let job = Job::new("late", json!(null)).with_priority(Priority::Low);
                queues.push(&job).await.unwrap();
                job.id
            })
        };

        let claimed = queues
            .dequeue(&default_routes(), Duration::from_secs(2))
            .await
            .unwrap();
        let pushed = producer.await.unwrap();
        assert_eq!(claimed, Some(pushed));
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_never_duplicates() {
        let queues = queues();
        let mut expected = HashSet::new();
        for i in 0..50 {
            let job = Job::new("n", json!(i));
            expected.insert(job.id.clone());
            queues.push(&job).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queues = queues.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(id) = queues
                    .dequeue(&[DEFAULT_ROUTE.to_string()], Duration::from_millis(10))
                    .await
                    .unwrap()
                {
                    got.push(id);
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job dequeued twice");
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_ack_and_depths() {
        let queues = queues();
        let job = Job::new("a", json!(null)).with_routing_key("gpu");
        queues.push(&job).await.unwrap();

        let depths = queues.depths().await.unwrap();
        assert_eq!(depths.len(), 3);
        assert!(depths
            .iter()
            .any(|d| d.route == "gpu" && d.priority == Priority::Normal && d.depth == 1));

        let claimed = queues
            .dequeue(&["gpu".to_string()], Duration::from_millis(10))
            .await
            .unwrap()
            .expect("job available");
        assert!(queues.ack(&claimed).await.unwrap());
        assert!(!queues.ack(&claimed).await.unwrap());
        assert_eq!(queues.processing_len().await.unwrap(), 0);
    }
}
