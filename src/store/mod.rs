//! Abstract keyed store consumed by the queue core.
//!
//! Every coordination primitive the system needs (reliable list moves,
//! sorted-set range pops, set-if-absent leases, pub/sub) goes through the
//! [`Store`] trait. Two implementations ship with the crate:
//!
//! - [`RedisStore`]: production backend, one Redis command or Lua script per
//!   primitive so that every operation is atomic server-side.
//! - [`MemoryStore`]: in-process store with the same semantics, used by the
//!   test suite and by single-process deployments.
//!
//! Queues and sets only ever hold job identifiers; job data lives in hashes.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::warn;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Stream of messages received on a subscribed channel.
pub type MessageStream = BoxStream<'static, String>;

/// Errors raised by store primitives.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Redis rejected or failed the command.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A key holds a value of a different type than the primitive expects.
    #[error("Wrong value type at key '{0}'")]
    WrongType(String),

    /// A stored record could not be decoded.
    #[error("Malformed record at '{key}': {message}")]
    Corrupt { key: String, message: String },

    /// Failed to serialize or deserialize a record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Primitive operations the queue core requires from its store.
///
/// Each method must be atomic with respect to concurrent callers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends `value` to the tail of the list at `key`.
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically pops the head of `src` and pushes it onto the tail of `dst`.
    ///
    /// Returns `None` immediately if `src` is empty.
    async fn list_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Blocking variant of [`Store::list_pop_head_push_tail`].
    ///
    /// Waits up to `timeout` for an element to appear in `src`.
    async fn list_blocking_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Removes up to one occurrence of `value` from the list at `key`.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive (negative indices count from the tail).
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Returns the length of the list at `key`.
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Adds `value` with `score` to the sorted set at `key`, updating the score if present.
    async fn sorted_set_add(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError>;

    /// Atomically removes and returns up to `limit` members with score `<= max_score`,
    /// lowest score first.
    async fn sorted_set_pop_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Returns the cardinality of the sorted set at `key`.
    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Sets `key` to `value` with a TTL only if the key is absent.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Adds `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Removes `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Returns all members of the set at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Writes `fields` into the hash at `key`.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Reads every field of the hash at `key`, `None` if absent or expired.
    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Sets a TTL on `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Removes any TTL from `key`.
    async fn persist(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Publishes `message` on `channel`.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribes to `channel`. Messages published after this call returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;
}

/// Backoff schedule for retrying store operations that failed transiently.
#[derive(Debug, Clone, Copy)]
pub struct StoreBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for StoreBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl StoreBackoff {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Runs `op`, retrying transient store failures with exponential backoff.
///
/// Non-retryable errors and the last transient error are returned as-is.
pub async fn with_store_retry<T, F, Fut>(
    backoff: StoreBackoff,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut failures = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && failures + 1 < backoff.max_attempts => {
                failures += 1;
                let delay = backoff.delay(failures);
                warn!(
                    operation = what,
                    error = %e,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "Store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
