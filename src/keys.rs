//! Store key layout.
//!
//! ```text
//! {prefix}:queue:{route}:{priority}   list of job ids awaiting dispatch
//! {prefix}:processing                 list of job ids claimed by a worker
//! {prefix}:scheduled                  sorted set of job ids, score = due time (epoch ms)
//! {prefix}:dead_letter                list of job ids that reached a terminal failure
//! {prefix}:job:{id}                   hash holding the job record
//! {prefix}:result:{id}                hash holding the job result (TTL bound)
//! {prefix}:results:{id}               pub/sub channel for completion of {id}
//! {prefix}:status:{status}            set of job ids currently in {status}
//! {prefix}:routes                     set of routing keys that have ever been used
//! {prefix}:lock:{name}                lease key
//! {prefix}:cron:{schedule}:{fire_ts}  dedup key for one cron firing
//! ```

use crate::queue::{JobId, JobStatus, Priority};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "bananas";

/// Route used by jobs submitted without a routing key.
pub const DEFAULT_ROUTE: &str = "default";

/// Derives every store key from a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    /// Creates a key space rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self, route: &str, priority: Priority) -> String {
        format!("{}:queue:{}:{}", self.prefix, route, priority)
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn result(&self, id: &JobId) -> String {
        format!("{}:result:{}", self.prefix, id)
    }

    pub fn result_channel(&self, id: &JobId) -> String {
        format!("{}:results:{}", self.prefix, id)
    }

    pub fn status_index(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    pub fn routes(&self) -> String {
        format!("{}:routes", self.prefix)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    pub fn cron_fire(&self, schedule: &str, fire_ts: i64) -> String {
        format!("{}:cron:{}:{}", self.prefix, schedule, fire_ts)
    }
}
