//! Job dispatch.
//!
//! - `HandlerRegistry`: job name to handler mapping, with per-handler timeouts
//! - `WorkerPool`: N concurrent workers claiming from a set of routes
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("send_email", |ctx| async move {
//!     send(ctx.payload()).await?;
//!     Ok(serde_json::json!({"sent": true}))
//! });
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(8), queue, Arc::new(registry));
//! pool.start().await?;
//! ```

pub mod registry;
pub mod worker_pool;

pub use registry::{
    FnHandler, Handler, HandlerRegistry, JobContext, RegisteredHandler, DEFAULT_JOB_TIMEOUT,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
