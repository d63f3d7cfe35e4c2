//! End-to-end job lifecycle tests against the in-memory store.
//!
//! These drive producers, worker pools and the scheduler loop together the
//! way a deployment does, with promotion ticks given explicit timestamps so
//! retry backoffs do not have to be waited out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bananas::client::{Client, ClientError, JobSpec};
use bananas::dispatcher::{HandlerRegistry, JobContext, WorkerPool, WorkerPoolConfig};
use bananas::keys::KeySpace;
use bananas::queue::{Job, JobId, JobQueue, JobStatus, Priority, ResultStatus};
use bananas::results::ResultError;
use bananas::scheduler::{
    CronScheduler, JobTemplate, RetryScheduler, Schedule, SchedulerConfig, TickOutcome,
};
use bananas::store::{MemoryStore, Store};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

struct Harness {
    store: Arc<MemoryStore>,
    keys: KeySpace,
    queue: Arc<JobQueue>,
    client: Client,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::new("test");
        let queue = Arc::new(
            JobQueue::new(store.clone(), keys.clone())
                .with_dequeue_slice(Duration::from_millis(10)),
        );
        let client = Client::new(queue.clone());
        Self {
            store,
            keys,
            queue,
            client,
        }
    }

    fn scheduler(&self) -> RetryScheduler {
        let config = SchedulerConfig::default().with_reap_interval(Duration::from_secs(3600));
        RetryScheduler::new(
            self.queue.clone(),
            self.store.clone() as Arc<dyn Store>,
            &self.keys,
            config,
        )
    }

    async fn pool(&self, routes: &[&str], registry: HandlerRegistry) -> WorkerPool {
        let config = WorkerPoolConfig::new(2)
            .with_routing_keys(routes.iter().copied())
            .with_dequeue_timeout(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(5));
        let mut pool = WorkerPool::new(config, self.queue.clone(), Arc::new(registry));
        pool.start().await.expect("pool starts");
        pool
    }

    async fn wait_for(&self, id: &JobId, check: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..500 {
            if let Some(job) = self.queue.get_job(id).await.unwrap() {
                if check(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached the expected state");
    }
}

fn just_after(at: DateTime<Utc>) -> DateTime<Utc> {
    at + chrono::Duration::milliseconds(1)
}

#[tokio::test]
async fn test_failing_job_retries_with_backoff_then_dead_letters() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    let executions = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = executions.clone();
    registry.register_fn("send_email", move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(anyhow::anyhow!("smtp connection refused"))
        }
    });
    let mut pool = harness.pool(&["default"], registry).await;

    let id = harness
        .client
        .submit(
            JobSpec::new("send_email", json!({"to": "a@example.com"}))
                .with_priority(Priority::High)
                .with_max_retries(3),
        )
        .await
        .unwrap();

    for (attempt, expected_secs) in [(1u32, 2i64), (2, 4), (3, 8)] {
        let job = harness
            .wait_for(&id, |job| {
                job.status == JobStatus::Scheduled && job.attempts == attempt
            })
            .await;
        let at = job.scheduled_for.expect("retry time recorded");
        let started = job.started_at.expect("execution start recorded");
        let delay = (at - started).num_milliseconds();
        assert!(
            delay >= expected_secs * 1000 && delay < (expected_secs + 1) * 1000,
            "attempt {attempt}: delay {delay}ms"
        );
        assert!(job.error.unwrap().contains("smtp connection refused"));

        // Not promoted before it is due
        let early = scheduler.tick(at - chrono::Duration::milliseconds(500)).await.unwrap();
        assert!(matches!(early, TickOutcome::Ran { promoted: 0, .. }));

        let due = scheduler.tick(just_after(at)).await.unwrap();
        assert!(matches!(due, TickOutcome::Ran { promoted: 1, .. }));
    }

    let job = harness
        .wait_for(&id, |job| job.status == JobStatus::Failed)
        .await;
    pool.shutdown().await.unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert_eq!(job.attempts, 4);

    let dead = harness.client.peek_dead_letter(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);

    let result = harness.client.get_result(&id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert!(result.error.unwrap().contains("smtp connection refused"));

    let depths = harness.client.queue_depths().await.unwrap();
    assert_eq!(depths.dead_letter, 1);
    assert_eq!(depths.pending() + depths.processing + depths.scheduled, 0);
}

#[tokio::test]
async fn test_scheduled_job_waits_for_its_tick() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();

    let mut registry = HandlerRegistry::new();
    registry.register_fn("report", |_ctx: JobContext| async move {
        anyhow::Ok(json!({"rows": 42}))
    });
    let mut pool = harness.pool(&["default"], registry).await;

    let at = Utc::now() + chrono::Duration::seconds(3600);
    let id = harness
        .client
        .submit_job_scheduled("report", json!(null), Priority::Normal, "nightly", at)
        .await
        .unwrap();

    let outcome = scheduler.tick(Utc::now()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Ran { promoted: 0, .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = harness.client.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(harness.client.queue_depths().await.unwrap().pending(), 0);

    let outcome = scheduler.tick(at).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Ran { promoted: 1, .. }));

    let job = harness
        .wait_for(&id, |job| job.status == JobStatus::Completed)
        .await;
    pool.shutdown().await.unwrap();

    assert!(job.scheduled_for.is_none());
    let result = harness.client.get_result(&id).await.unwrap();
    assert_eq!(result.result, Some(json!({"rows": 42})));
}

#[tokio::test]
async fn test_pool_only_claims_its_routes() {
    let harness = Harness::new();

    let mut registry = HandlerRegistry::new();
    registry.register_fn("render", |_ctx: JobContext| async move { anyhow::Ok(json!("gpu")) });
    registry.register_fn("send_email", |_ctx: JobContext| async move {
        anyhow::Ok(json!("email"))
    });
    let mut pool = harness.pool(&["email"], registry).await;

    let gpu = harness
        .client
        .submit_job_with_route("render", json!(null), Priority::High, "", "gpu")
        .await
        .unwrap();
    let email = harness
        .client
        .submit_job_with_route("send_email", json!(null), Priority::Low, "", "email")
        .await
        .unwrap();

    harness
        .wait_for(&email, |job| job.status == JobStatus::Completed)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown().await.unwrap();

    let job = harness.client.get_job(&gpu).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.routing_key.as_deref(), Some("gpu"));
    assert_eq!(pool.stats().jobs_completed, 1);
}

#[tokio::test]
async fn test_submit_and_wait_round_trip_and_timeout() {
    let harness = Harness::new();

    let mut registry = HandlerRegistry::new();
    registry.register_fn("add", |ctx: JobContext| async move {
        let a = ctx.payload()["a"].as_i64().unwrap_or(0);
        let b = ctx.payload()["b"].as_i64().unwrap_or(0);
        anyhow::Ok(json!({"sum": a + b}))
    });
    let mut pool = harness.pool(&["default"], registry).await;

    let result = harness
        .client
        .submit_and_wait(JobSpec::new("add", json!({"a": 2, "b": 3})), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.result, Some(json!({"sum": 5})));

    // Nobody serves this route, so no result can arrive
    let err = harness
        .client
        .submit_and_wait(
            JobSpec::new("add", json!({})).with_routing_key("nowhere"),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    pool.shutdown().await.unwrap();

    let ClientError::SubmitTimeout { id, .. } = err else {
        panic!("expected submit timeout, got {err}");
    };
    let job = harness.client.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_submit_and_wait_reports_terminal_failure_as_result() {
    let harness = Harness::new();
    let mut pool = harness.pool(&["default"], HandlerRegistry::new()).await;

    let result = harness
        .client
        .submit_and_wait(JobSpec::new("unregistered", json!({})), Duration::from_secs(5))
        .await
        .unwrap();
    pool.shutdown().await.unwrap();

    assert_eq!(result.status, ResultStatus::Failed);
    assert!(result.error.unwrap().contains("unregistered"));

    let job = harness.client.get_job(&result.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_panicking_and_hanging_handlers_are_failures() {
    let harness = Harness::new();

    async fn explode(_ctx: JobContext) -> anyhow::Result<Value> {
        panic!("handler blew up")
    }

    let mut registry = HandlerRegistry::new();
    registry.register_fn("explode", explode);
    registry.register_fn_with_timeout("hang", Duration::from_millis(50), |_ctx: JobContext| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::Ok(Value::Null)
    });
    let mut pool = harness.pool(&["default"], registry).await;

    let panicked = harness
        .client
        .submit(JobSpec::new("explode", json!(null)).with_max_retries(0))
        .await
        .unwrap();
    let hung = harness
        .client
        .submit(JobSpec::new("hang", json!(null)).with_max_retries(1))
        .await
        .unwrap();

    let job = harness
        .wait_for(&panicked, |job| job.status == JobStatus::Failed)
        .await;
    assert!(job.error.unwrap().contains("handler blew up"));
    assert_eq!(job.attempts, 1);

    let job = harness
        .wait_for(&hung, |job| job.status == JobStatus::Scheduled)
        .await;
    pool.shutdown().await.unwrap();

    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("timed out"));
    assert_eq!(harness.client.peek_dead_letter(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_requeued_dead_letter_runs_again() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = calls.clone();
    registry.register_fn("flaky", move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first call fails");
            }
            anyhow::Ok(json!("ok"))
        }
    });
    let mut pool = harness.pool(&["default"], registry).await;

    let id = harness
        .client
        .submit(JobSpec::new("flaky", json!(null)).with_max_retries(0))
        .await
        .unwrap();
    harness
        .wait_for(&id, |job| job.status == JobStatus::Failed)
        .await;

    let job = harness.client.requeue_dead_letter(&id).await.unwrap();
    assert_eq!(job.attempts, 0);
    assert_eq!(job.status, JobStatus::Pending);

    harness
        .wait_for(&id, |job| job.status == JobStatus::Completed)
        .await;
    pool.shutdown().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(harness.client.peek_dead_letter(10).await.unwrap().is_empty());
    assert!(harness.client.get_result(&id).await.unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn test_completed_job_expires_after_success_ttl() {
    let harness = Harness::new();
    let queue = JobQueue::new(harness.store.clone(), harness.keys.clone())
        .with_result_ttls(Duration::from_secs(60), Duration::from_secs(600));

    let id = queue.submit(Job::new("ping", json!(null))).await.unwrap();
    let job = queue
        .claim(&["default".to_string()], Duration::from_millis(10))
        .await
        .unwrap()
        .expect("job claimed");
    queue
        .complete(job, json!("pong"), "worker-0", Duration::from_millis(1))
        .await
        .unwrap();

    assert!(queue.results().get(&id).await.is_ok());
    tokio::time::advance(Duration::from_secs(61)).await;

    assert!(matches!(
        queue.results().get(&id).await,
        Err(ResultError::NotFound(_))
    ));
    assert!(queue.get_job(&id).await.unwrap().is_none());
    assert!(queue
        .list_jobs_by_status(JobStatus::Completed, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cron_schedule_feeds_the_queue() {
    let harness = Harness::new();
    let schedule = Schedule::new(
        "cleanup",
        "0 * * * * *",
        JobTemplate::new("cleanup", json!({"older_than_days": 7})).with_priority(Priority::Low),
    )
    .unwrap();
    let cron = CronScheduler::new(
        harness.queue.clone(),
        harness.store.clone(),
        harness.keys.clone(),
        vec![schedule],
    );
    let scheduler = harness.scheduler().with_cron(cron);

    let start: DateTime<Utc> = "2026-01-01T00:00:30Z".parse().unwrap();
    scheduler.tick(start).await.unwrap();
    assert!(harness
        .client
        .list_jobs_by_status(JobStatus::Pending, 10)
        .await
        .unwrap()
        .is_empty());

    scheduler
        .tick(start + chrono::Duration::seconds(45))
        .await
        .unwrap();
    let pending = harness
        .client
        .list_jobs_by_status(JobStatus::Pending, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "cleanup");
    assert_eq!(pending[0].priority, Priority::Low);
}
