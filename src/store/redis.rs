//! Redis-backed store.
//!
//! Non-blocking commands share one auto-reconnecting [`ConnectionManager`].
//! Blocking list moves and subscriptions each use a dedicated connection so
//! they never stall the multiplexed one. Blocking connections are returned to
//! a small idle pool after a clean reply and reused by the next caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::redis::aio::{Connection, ConnectionManager};
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use super::{MessageStream, Store, StoreError};

/// Atomically pops every member with score <= ARGV[1], at most ARGV[2] of them.
const POP_RANGE_BY_SCORE_LUA: &str = r"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #items > 0 then
  redis.call('ZREM', KEYS[1], unpack(items))
end
return items
";

/// Deletes KEYS[1] only when it still holds ARGV[1].
const DELETE_IF_EQUALS_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Most blocking connections kept open while idle.
const MAX_IDLE_BLOCKING: usize = 32;

/// Last-in first-out stack of idle connections.
struct IdleConnections<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> IdleConnections<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Returns `conn` to the pool, or closes it when the pool is full.
    fn put(&self, conn: C) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// [`Store`] implementation backed by a Redis server (6.2+ for LMOVE/BLMOVE).
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
    blocking: Arc<IdleConnections<Connection>>,
    pop_range_script: Script,
    delete_if_equals_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!("Connected to Redis");

        Ok(Self {
            client,
            redis,
            blocking: Arc::new(IdleConnections::new(MAX_IDLE_BLOCKING)),
            pop_range_script: Script::new(POP_RANGE_BY_SCORE_LUA),
            delete_if_equals_script: Script::new(DELETE_IF_EQUALS_LUA),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let moved: Option<String> = ::redis::cmd("LMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn list_blocking_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        // A zero timeout means "block forever" to Redis; never send it.
        let timeout_secs = timeout.as_secs_f64().max(0.01);
        let mut conn = match self.blocking.take() {
            Some(conn) => conn,
            None => self.client.get_async_connection().await?,
        };
        // A connection that errored or was dropped mid-command is not reused
        let moved: Option<String> = ::redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        self.blocking.put(conn);
        Ok(moved)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.lrem(key, 1, value).await?;
        Ok(removed)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let items: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(items)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn sorted_set_add(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(key, value, score).await?;
        Ok(())
    }

    async fn sorted_set_pop_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let items: Vec<String> = self
            .pop_range_script
            .key(key)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .delete_if_equals_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        // HGETALL on a missing key yields an empty map.
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let applied: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn persist(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("PERSIST")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
