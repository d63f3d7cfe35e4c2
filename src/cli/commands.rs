//! CLI command definitions for bananas.
//!
//! The binary is an operator tool over a shared store: it runs the scheduler
//! loop and submits, inspects and requeues jobs. Workers embed the library and
//! register their own handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{Client, ClientError, JobSpec};
use crate::config::Config;
use crate::metrics::{init_metrics, MetricsCollector};
use crate::queue::{Job, JobId, JobQueue, JobResult, JobStatus, Priority};
use crate::results::ResultError;
use crate::scheduler::{load_schedules, CronScheduler, RetryScheduler};
use crate::store::{RedisStore, Store};

/// Default number of entries listed by `dead-letter list` and `list`.
const DEFAULT_LIST_LIMIT: usize = 20;

/// Operator CLI for the bananas task queue.
#[derive(Parser)]
#[command(name = "bananas")]
#[command(about = "Priority job queue with retries, scheduling and cron on Redis")]
#[command(version)]
#[command(
    long_about = "bananas runs the retry/scheduler loop and manages jobs in a Redis-backed queue.\n\nSettings are read from BANANAS_* environment variables.\n\nExample usage:\n  bananas scheduler --schedules ./schedules.yaml\n  bananas submit send_email --payload '{\"to\":\"a@example.com\"}' --priority high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level for bananas itself (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL, overriding BANANAS_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the retry/scheduler loop until interrupted.
    Scheduler(SchedulerArgs),

    /// Submit a job.
    Submit(SubmitArgs),

    /// Show a job and its result.
    Inspect(InspectArgs),

    /// List jobs in a given status.
    List(ListArgs),

    /// Show queue depths.
    Stats,

    /// Inspect or requeue dead-lettered jobs.
    #[command(name = "dead-letter", alias = "dlq")]
    DeadLetter(DeadLetterArgs),
}

/// Arguments for `bananas scheduler`.
#[derive(Parser, Debug)]
pub struct SchedulerArgs {
    /// YAML file with cron schedules, overriding BANANAS_SCHEDULES_FILE.
    #[arg(short, long)]
    pub schedules: Option<PathBuf>,
}

/// Arguments for `bananas submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Handler name.
    pub name: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Priority (high, normal, low).
    #[arg(short = 'P', long, default_value = "normal")]
    pub priority: Priority,

    /// Routing key restricting which pools may run the job.
    #[arg(short, long)]
    pub route: Option<String>,

    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Retry budget, overriding BANANAS_MAX_RETRIES.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Defer the job by this many seconds.
    #[arg(long, conflicts_with = "wait")]
    pub delay_secs: Option<u64>,

    /// Wait up to this many seconds for the result.
    #[arg(short, long)]
    pub wait: Option<u64>,
}

/// Arguments for `bananas inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Job ID.
    pub id: String,
}

/// Arguments for `bananas list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Status (pending, processing, scheduled, completed, failed).
    pub status: JobStatus,

    #[arg(short = 'n', long, default_value_t = DEFAULT_LIST_LIMIT)]
    pub limit: usize,
}

/// Arguments for `bananas dead-letter`.
#[derive(Parser, Debug)]
pub struct DeadLetterArgs {
    #[command(subcommand)]
    pub command: DeadLetterSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum DeadLetterSubcommand {
    /// List dead-lettered jobs, oldest first.
    List {
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Move a dead-lettered job back to its queue with a fresh retry budget.
    Requeue {
        /// Job ID.
        id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectOutput {
    job: Job,
    result: Option<JobResult>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Filter used when `RUST_LOG` is unset: `level` for this crate and only
/// warnings from dependencies such as `redis`.
pub fn default_log_filter(level: &str) -> String {
    format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level)
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }

    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let queue = Arc::new(config.job_queue(store.clone()));

    match cli.command {
        Commands::Scheduler(args) => run_scheduler_command(args, config, store, queue).await,
        Commands::Submit(args) => run_submit_command(args, &config, queue).await,
        Commands::Inspect(args) => run_inspect_command(args, queue).await,
        Commands::List(args) => run_list_command(args, queue).await,
        Commands::Stats => run_stats_command(queue).await,
        Commands::DeadLetter(args) => run_dead_letter_command(args, queue).await,
    }
}

async fn run_scheduler_command(
    args: SchedulerArgs,
    config: Config,
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
) -> anyhow::Result<()> {
    init_metrics()?;

    let keys = config.key_space();
    let mut scheduler =
        RetryScheduler::new(queue.clone(), store.clone(), &keys, config.scheduler_config());

    if let Some(path) = args.schedules.or_else(|| config.schedules_file.clone()) {
        let schedules = load_schedules(&path)?;
        info!(path = %path.display(), count = schedules.len(), "Loaded cron schedules");
        scheduler = scheduler.with_cron(CronScheduler::new(queue, store, keys, schedules));
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, stopping scheduler"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        signal_token.cancel();
    });

    scheduler.run(shutdown).await;
    Ok(())
}

async fn run_submit_command(
    args: SubmitArgs,
    config: &Config,
    queue: Arc<JobQueue>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {}", e))?;
    let client = Client::new(queue).with_default_max_retries(config.max_retries);

    let mut spec = JobSpec::new(args.name, payload)
        .with_priority(args.priority)
        .with_description(args.description);
    if let Some(route) = args.route {
        spec = spec.with_routing_key(route);
    }
    if let Some(max_retries) = args.max_retries {
        spec = spec.with_max_retries(max_retries);
    }
    if let Some(secs) = args.delay_secs {
        let delay = chrono::Duration::seconds(i64::try_from(secs)?);
        spec = spec.scheduled_for(Utc::now() + delay);
    }

    match args.wait {
        Some(secs) => {
            match client
                .submit_and_wait(spec, Duration::from_secs(secs))
                .await
            {
                Ok(result) => print_json(&result),
                Err(ClientError::SubmitTimeout { id, timeout }) => {
                    anyhow::bail!("Job {} did not finish within {:?}", id, timeout)
                }
                Err(e) => Err(e.into()),
            }
        }
        None => {
            let id = client.submit(spec).await?;
            println!("{}", id);
            Ok(())
        }
    }
}

async fn run_inspect_command(args: InspectArgs, queue: Arc<JobQueue>) -> anyhow::Result<()> {
    let client = Client::new(queue);
    let id = JobId::from(args.id);
    let job = client.get_job(&id).await?;
    let result = match client.get_result(&id).await {
        Ok(result) => Some(result),
        Err(ClientError::Result(ResultError::NotFound(_))) => None,
        Err(e) => return Err(e.into()),
    };
    print_json(&InspectOutput { job, result })
}

async fn run_list_command(args: ListArgs, queue: Arc<JobQueue>) -> anyhow::Result<()> {
    let jobs = Client::new(queue)
        .list_jobs_by_status(args.status, args.limit)
        .await?;
    print_json(&jobs)
}

async fn run_stats_command(queue: Arc<JobQueue>) -> anyhow::Result<()> {
    let depths = Client::new(queue).queue_depths().await?;
    init_metrics()?;
    MetricsCollector::new().update_queue_depths(&depths);
    print_json(&depths)
}

async fn run_dead_letter_command(
    args: DeadLetterArgs,
    queue: Arc<JobQueue>,
) -> anyhow::Result<()> {
    let client = Client::new(queue);
    match args.command {
        DeadLetterSubcommand::List { limit } => print_json(&client.peek_dead_letter(limit).await?),
        DeadLetterSubcommand::Requeue { id } => {
            let job = client.requeue_dead_letter(&JobId::from(id)).await?;
            info!(job_id = %job.id, name = %job.name, "Job requeued");
            print_json(&job)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_command_defaults() {
        let cli = Cli::try_parse_from(["bananas", "submit", "send_email"]).expect("should parse");

        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.name, "send_email");
                assert_eq!(args.payload, "{}");
                assert_eq!(args.priority, Priority::Normal);
                assert!(args.route.is_none());
                assert!(args.max_retries.is_none());
                assert!(args.wait.is_none());
            }
            _ => panic!("Expected Submit command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_submit_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "bananas",
            "--redis-url",
            "redis://cache:6379",
            "submit",
            "render",
            "-p",
            r#"{"frame": 7}"#,
            "-P",
            "high",
            "-r",
            "gpu",
            "-d",
            "frame seven",
            "--max-retries",
            "1",
            "--wait",
            "30",
        ])
        .expect("should parse");

        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.priority, Priority::High);
                assert_eq!(args.route.as_deref(), Some("gpu"));
                assert_eq!(args.description, "frame seven");
                assert_eq!(args.max_retries, Some(1));
                assert_eq!(args.wait, Some(30));
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_delay_conflicts_with_wait() {
        let parsed = Cli::try_parse_from([
            "bananas",
            "submit",
            "report",
            "--delay-secs",
            "60",
            "--wait",
            "5",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_invalid_priority_rejected() {
        assert!(Cli::try_parse_from(["bananas", "submit", "x", "-P", "urgent"]).is_err());
    }

    #[test]
    fn test_list_and_dead_letter_commands() {
        let cli = Cli::try_parse_from(["bananas", "list", "failed", "-n", "5"]).unwrap();
        match cli.command {
            Commands::List(args) => {
                assert_eq!(args.status, JobStatus::Failed);
                assert_eq!(args.limit, 5);
            }
            _ => panic!("Expected List command"),
        }

        let cli = Cli::try_parse_from(["bananas", "dlq", "requeue", "abc"]).unwrap();
        match cli.command {
            Commands::DeadLetter(DeadLetterArgs {
                command: DeadLetterSubcommand::Requeue { id },
            }) => assert_eq!(id, "abc"),
            _ => panic!("Expected dead-letter requeue"),
        }

        let cli = Cli::try_parse_from(["bananas", "dead-letter", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::DeadLetter(DeadLetterArgs {
                command: DeadLetterSubcommand::List { limit: DEFAULT_LIST_LIMIT },
            })
        ));
    }

    #[test]
    fn test_scheduler_command() {
        let cli =
            Cli::try_parse_from(["bananas", "scheduler", "-s", "/tmp/schedules.yaml"]).unwrap();
        match cli.command {
            Commands::Scheduler(args) => {
                assert_eq!(args.schedules, Some(PathBuf::from("/tmp/schedules.yaml")));
            }
            _ => panic!("Expected Scheduler command"),
        }
    }

    #[test]
    fn test_default_log_filter_scopes_level_to_crate() {
        assert_eq!(default_log_filter("debug"), "warn,bananas=debug");
        assert!(tracing_subscriber::EnvFilter::try_new(default_log_filter("trace")).is_ok());
    }
}
