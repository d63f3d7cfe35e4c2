//! Handler registry.
//!
//! Maps job names to handlers. Each registration carries an optional
//! per-handler timeout that overrides the registry default.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::Job;

/// Default hard deadline for a handler invocation.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a handler gets for one invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// 1-based number of the current execution.
    pub fn attempt(&self) -> u32 {
        self.job.attempts + 1
    }

    /// Token cancelled when the invocation hits its deadline.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A job handler.
///
/// Returning `Err` or panicking counts as a failed attempt. The output value
/// is stored as the job result.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Adapts an async closure into a `Handler`.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        (self.0)(ctx).await
    }
}

/// A handler plus the deadline it runs under.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn Handler>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, (Arc<dyn Handler>, Option<Duration>)>,
    default_timeout: Duration,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Sets the timeout used by handlers registered without one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Registers `handler` for jobs named `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(name.into(), (handler, None));
        self
    }

    /// Registers `handler` with its own hard deadline.
    pub fn register_with_timeout(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        timeout: Duration,
    ) -> &mut Self {
        self.handlers.insert(name.into(), (handler, Some(timeout)));
        self
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    /// Registers an async closure with its own hard deadline.
    pub fn register_fn_with_timeout<F, Fut>(
        &mut self,
        name: impl Into<String>,
        timeout: Duration,
        f: F,
    ) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register_with_timeout(name, Arc::new(FnHandler(f)), timeout)
    }

    /// Looks up the handler for `name` together with its effective timeout.
    pub fn get(&self, name: &str) -> Option<RegisteredHandler> {
        self.handlers
            .get(name)
            .map(|(handler, timeout)| RegisteredHandler {
                handler: Arc::clone(handler),
                timeout: timeout.unwrap_or(self.default_timeout),
            })
    }

    /// Longest deadline any lookup can return.
    pub fn max_timeout(&self) -> Duration {
        self.handlers
            .values()
            .filter_map(|(_, timeout)| *timeout)
            .fold(self.default_timeout, Duration::max)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
