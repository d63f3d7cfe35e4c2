//! Recurring jobs.
//!
//! A `Schedule` pairs a cron expression (seconds-resolution, as accepted by
//! the `cron` crate) and a timezone with a job template. `CronScheduler`
//! evaluates every schedule on each tick and submits a job for the latest
//! fire time that passed since the previous evaluation. Several instances may
//! evaluate the same schedule; a set-if-absent key per schedule and fire time
//! makes sure only one of them materializes the job.
//!
//! Schedules can be loaded from YAML:
//!
//! ```yaml
//! schedules:
//!   - name: nightly-report
//!     cron: "0 0 2 * * *"
//!     timezone: Europe/Berlin
//!     job:
//!       name: build_report
//!       payload: { kind: daily }
//!       priority: low
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keys::KeySpace;
use crate::queue::{Job, JobId, JobQueue, Priority};
use crate::store::Store;

use super::SchedulerError;

/// How long a fire-time dedup key lives.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Job created each time a schedule fires.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    /// Handler name.
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, alias = "routing_key")]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "max_retries")]
    pub max_retries: Option<u32>,
}

impl JobTemplate {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: Priority::Normal,
            routing_key: None,
            description: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    fn to_job(&self, schedule: &str, fire_time: DateTime<Utc>) -> Job {
        let mut job = Job::new(&self.name, self.payload.clone())
            .with_priority(self.priority)
            .with_description(
                self.description
                    .clone()
                    .unwrap_or_else(|| format!("cron:{schedule} at {fire_time}")),
            );
        if let Some(route) = &self.routing_key {
            job = job.with_routing_key(route);
        }
        if let Some(max_retries) = self.max_retries {
            job = job.with_max_retries(max_retries);
        }
        job
    }
}

/// Schedule as written in a schedules file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub job: JobTemplate,
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<ScheduleDefinition>,
}

/// A parsed recurring job.
#[derive(Debug, Clone)]
pub struct Schedule {
    name: String,
    expression: String,
    cron: cron::Schedule,
    timezone: Tz,
    template: JobTemplate,
}

impl Schedule {
    /// Parses `expression` into a UTC schedule.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidSchedule` if the expression does not parse.
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        template: JobTemplate,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        let expression = expression.into();
        let cron = cron::Schedule::from_str(&expression).map_err(|e| {
            SchedulerError::InvalidSchedule {
                name: name.clone(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            name,
            expression,
            cron,
            timezone: Tz::UTC,
            template,
        })
    }

    /// Evaluates the expression in the IANA timezone `tz`.
    pub fn with_timezone(mut self, tz: &str) -> Result<Self, SchedulerError> {
        self.timezone = tz.parse::<Tz>().map_err(|e| SchedulerError::InvalidSchedule {
            name: self.name.clone(),
            message: format!("unknown timezone '{tz}': {e}"),
        })?;
        Ok(self)
    }

    pub fn from_definition(def: ScheduleDefinition) -> Result<Self, SchedulerError> {
        let schedule = Self::new(def.name, def.cron, def.job)?;
        match def.timezone {
            Some(tz) => schedule.with_timezone(&tz),
            None => Ok(schedule),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Latest fire time in `(after, until]`, if any.
    pub fn latest_fire_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= until)
            .last()
    }
}

/// Loads schedule definitions from a YAML file.
pub fn load_schedules(path: impl AsRef<Path>) -> Result<Vec<Schedule>, SchedulerError> {
    let path = path.as_ref();
    let contents =
        std::fs::read_to_string(path).map_err(|e| SchedulerError::ScheduleFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    parse_schedules(&contents).map_err(|e| match e {
        SchedulerError::ScheduleFile { message, .. } => SchedulerError::ScheduleFile {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })
}

/// Parses schedule definitions from YAML text.
pub fn parse_schedules(yaml: &str) -> Result<Vec<Schedule>, SchedulerError> {
    let file: ScheduleFile =
        serde_yaml::from_str(yaml).map_err(|e| SchedulerError::ScheduleFile {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
    file.schedules
        .into_iter()
        .map(Schedule::from_definition)
        .collect()
}

/// Evaluates schedules and materializes their jobs.
pub struct CronScheduler {
    queue: Arc<JobQueue>,
    store: Arc<dyn Store>,
    keys: KeySpace,
    schedules: Vec<Schedule>,
    last_checked: Mutex<HashMap<String, DateTime<Utc>>>,
    dedup_ttl: Duration,
    instance: String,
}

impl CronScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn Store>,
        keys: KeySpace,
        schedules: Vec<Schedule>,
    ) -> Self {
        Self {
            queue,
            store,
            keys,
            schedules,
            last_checked: Mutex::new(HashMap::new()),
            dedup_ttl: DEFAULT_DEDUP_TTL,
            instance: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// Submits a job for every schedule that fired since the last call.
    ///
    /// The first call only records `now` as the starting point, so fire times
    /// from before the process started are not replayed. Several missed fire
    /// times of one schedule collapse into a single job for the latest one.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, SchedulerError> {
        let mut last_checked = self.last_checked.lock().await;
        let mut submitted = Vec::new();

        for schedule in &self.schedules {
            let Some(since) = last_checked.insert(schedule.name.clone(), now) else {
                debug!(schedule = %schedule.name, next = ?schedule.next_after(now), "Cron schedule armed");
                continue;
            };
            let Some(fire_time) = schedule.latest_fire_between(since, now) else {
                continue;
            };

            let dedup_key = self.keys.cron_fire(&schedule.name, fire_time.timestamp());
            let won = self
                .store
                .set_if_absent_with_ttl(&dedup_key, &self.instance, self.dedup_ttl)
                .await;
            let won = match won {
                Ok(won) => won,
                Err(e) => {
                    // Retry this fire time on the next tick
                    last_checked.insert(schedule.name.clone(), since);
                    return Err(e.into());
                }
            };
            if !won {
                debug!(schedule = %schedule.name, fire_time = %fire_time, "Cron fire already materialized");
                continue;
            }

            let job = schedule.template.to_job(&schedule.name, fire_time);
            let id = match self.queue.submit(job).await {
                Ok(id) => id,
                Err(e) => {
                    // Give the fire time back so this or another instance retries it
                    let released = self.store.delete_if_equals(&dedup_key, &self.instance).await;
                    if let Err(release) = released {
                        warn!(
                            schedule = %schedule.name,
                            fire_time = %fire_time,
                            error = %release,
                            "Failed to release cron dedup key"
                        );
                    }
                    last_checked.insert(schedule.name.clone(), since);
                    return Err(e.into());
                }
            };
            info!(
                schedule = %schedule.name,
                fire_time = %fire_time,
                job_id = %id,
                "Cron schedule fired"
            );
            submitted.push(id);
        }
        Ok(submitted)
    }
}
