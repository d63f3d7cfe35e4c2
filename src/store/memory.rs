//! In-process store with Redis semantics.
//!
//! All state sits behind a single mutex, so every primitive is trivially
//! atomic. Blocking list moves park on a [`Notify`] that is signalled on every
//! list push. Expiry is evaluated lazily on access.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use ordered_float::OrderedFloat;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{MessageStream, Store, StoreError};

/// Capacity of each pub/sub channel buffer.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(OrderedFloat<f64>, String)>,
    scores: HashMap<String, OrderedFloat<f64>>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.by_score.remove(&(old, member.to_string()));
        }
        let score = OrderedFloat(score);
        self.scores.insert(member.to_string(), score);
        self.by_score.insert((score, member.to_string()));
    }

    fn pop_up_to(&mut self, max_score: f64, limit: usize) -> Vec<String> {
        let due: Vec<(OrderedFloat<f64>, String)> = self
            .by_score
            .iter()
            .take_while(|(score, _)| score.0 <= max_score)
            .take(limit)
            .cloned()
            .collect();

        due.into_iter()
            .map(|entry| {
                self.by_score.remove(&entry);
                self.scores.remove(&entry.1);
                entry.1
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    SortedSet(SortedSet),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    /// Returns the live entry at `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn set_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut HashSet<String>>, StoreError> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries
                .insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn zset_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut SortedSet>, StoreError> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.entries.insert(
                key.to_string(),
                Entry::new(Value::SortedSet(SortedSet::default())),
            );
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::SortedSet(zset)) => Ok(Some(zset)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    /// Removes empty collections the way Redis does.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            Some(Value::SortedSet(z)) => z.len() == 0,
            Some(Value::Hash(h)) => h.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn move_head_to_tail(&mut self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        // Validate the destination type before mutating the source.
        if let Some(entry) = self.live(dst) {
            if !matches!(entry.value, Value::List(_)) {
                return Err(StoreError::WrongType(dst.to_string()));
            }
        }
        let popped = match self.list_mut(src, false)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        let Some(value) = popped else {
            return Ok(None);
        };
        self.drop_if_empty(src);
        if let Some(list) = self.list_mut(dst, true)? {
            list.push_back(value.clone());
        }
        Ok(Some(value))
    }
}

/// In-process [`Store`] implementation.
///
/// Cloning shares the underlying state, so several components (client,
/// worker pool, scheduler) can operate on one store exactly as they would on
/// one Redis instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    list_pushed: Arc<Notify>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-operation;
        // every primitive leaves the maps consistent before it can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether `key` currently exists (expired keys do not).
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live(key).is_some()
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            if let Some(list) = inner.list_mut(key, true)? {
                list.push_back(value.to_string());
            }
        }
        self.list_pushed.notify_waiters();
        Ok(())
    }

    async fn list_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let moved = self.lock().move_head_to_tail(src, dst)?;
        if moved.is_some() {
            self.list_pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn list_blocking_pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.list_pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.list_pop_head_push_tail(src, dst).await? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let removed = match inner.list_mut(key, false)? {
            Some(list) => match list.iter().position(|v| v == value) {
                Some(pos) => {
                    list.remove(pos);
                    1
                }
                None => 0,
            },
            None => 0,
        };
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        let Some(list) = inner.list_mut(key, false)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().list_mut(key, false)?.map_or(0, |l| l.len()))
    }

    async fn sorted_set_add(&self, key: &str, score: f64, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(zset) = inner.zset_mut(key, true)? {
            zset.insert(score, value);
        }
        Ok(())
    }

    async fn sorted_set_pop_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        let popped = match inner.zset_mut(key, false)? {
            Some(zset) => zset.pop_up_to(max_score, limit),
            None => Vec::new(),
        };
        inner.drop_if_empty(key);
        Ok(popped)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().zset_mut(key, false)?.map_or(0, |z| z.len()))
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let matches = matches!(
            inner.live(key).map(|e| &e.value),
            Some(Value::Str(current)) if current == value
        );
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(set) = inner.set_mut(key, true)? {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(set) = inner.set_mut(key, false)? {
            set.remove(member);
        }
        inner.drop_if_empty(key);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .set_mut(key, false)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.live(key).is_none() {
            inner
                .entries
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        match inner.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => {
                for (field, value) in fields {
                    hash.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get(&self, key: &str) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(Some(hash.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn persist(&self, key: &str) -> Result<(), StoreError> {
        if let Some(entry) = self.lock().live(key) {
            entry.expires_at = None;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(tx) = inner.channels.get(channel) {
            // No receivers: Redis PUBLISH to an empty channel is a no-op.
            if tx.send(message.to_string()).is_err() {
                inner.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let rx = {
            let mut inner = self.lock();
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        Ok(Subscription {
            rx: Some(BroadcastStream::new(rx)),
            channel: channel.to_string(),
            inner: Arc::downgrade(&self.inner),
        }
        .boxed())
    }
}

/// Receiving end of a channel. Dropping the last one removes the channel.
struct Subscription {
    rx: Option<BroadcastStream<String>>,
    channel: String,
    inner: Weak<Mutex<Inner>>,
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        loop {
            match rx.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => return Poll::Ready(Some(msg)),
                // Lagged: the skipped messages are gone, keep reading.
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release our receiver before counting the ones left.
        drop(self.rx.take());
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        let unused = inner
            .channels
            .get(&self.channel)
            .is_some_and(|tx| tx.receiver_count() == 0);
        if unused {
            inner.channels.remove(&self.channel);
        }
    }
}
