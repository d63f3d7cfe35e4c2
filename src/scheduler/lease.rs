//! TTL lease over a single store key.
//!
//! Acquire succeeds only when the key is absent. Release deletes the key only
//! if it still holds this holder's token, so a lease that already expired and
//! was taken over by another instance is left alone.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct Lease {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    /// Creates a lease on `key` with a fresh holder token.
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to take the lease. Returns `false` if another holder has it.
    pub async fn try_acquire(&self) -> Result<bool, StoreError> {
        self.store
            .set_if_absent_with_ttl(&self.key, &self.token, self.ttl)
            .await
    }

    /// Releases the lease if this holder still owns it.
    pub async fn release(&self) -> Result<bool, StoreError> {
        self.store.delete_if_equals(&self.key, &self.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_only_one_holder() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = Lease::new(store.clone(), "lock:test", Duration::from_secs(5));
        let b = Lease::new(store.clone(), "lock:test", Duration::from_secs(5));

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        // b does not own it, so it cannot release it
        assert!(!b.release().await.unwrap());
        assert!(a.release().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_when_holder_dies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dead = Lease::new(store.clone(), "lock:test", Duration::from_secs(2));
        let live = Lease::new(store.clone(), "lock:test", Duration::from_secs(2));

        assert!(dead.try_acquire().await.unwrap());
        assert!(!live.try_acquire().await.unwrap());

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(live.try_acquire().await.unwrap());
        assert!(!dead.release().await.unwrap());
    }
}
