//! Worker settings read from the environment.

use core_config::{env_or_default, env_parse, env_parse_opt, ConfigError, FromEnv};
use nats_jobs::config::{DEFAULT_BATCH, DEFAULT_NUM_ATTEMPTS, DEFAULT_PULL_INTERVAL};
use nats_jobs::{DelayedPoll, JobDef, Perform, Rule};
use std::time::Duration;

const DEFAULT_STREAM: &str = "jobs";
const DEFAULT_DELAYED_POLL_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_SECS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Stream, subject and consumer prefix of the job.
    pub stream: String,
    pub batch: usize,
    pub pull_interval: Duration,
    pub timeout: Option<Duration>,
    pub num_attempts: u32,
    pub delayed_poll: Duration,
    /// Period of the recurring heartbeat job; `None` disables it.
    pub heartbeat: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM.to_string(),
            batch: DEFAULT_BATCH,
            pull_interval: DEFAULT_PULL_INTERVAL,
            timeout: None,
            num_attempts: DEFAULT_NUM_ATTEMPTS,
            delayed_poll: Duration::from_millis(DEFAULT_DELAYED_POLL_MS),
            heartbeat: Some(Duration::from_secs(DEFAULT_HEARTBEAT_SECS)),
        }
    }
}

impl FromEnv for WorkerConfig {
    /// Reads JOBS_STREAM, JOBS_BATCH, JOBS_PULL_INTERVAL_MS, JOBS_TIMEOUT_MS,
    /// JOBS_NUM_ATTEMPTS, JOBS_DELAYED_POLL_MS and JOBS_HEARTBEAT_SECS
    /// (0 disables the heartbeat).
    fn from_env() -> Result<Self, ConfigError> {
        let pull_interval_ms = env_parse(
            "JOBS_PULL_INTERVAL_MS",
            DEFAULT_PULL_INTERVAL.as_millis() as u64,
        )?;
        let heartbeat_secs = env_parse("JOBS_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;

        Ok(Self {
            stream: env_or_default("JOBS_STREAM", DEFAULT_STREAM),
            batch: env_parse("JOBS_BATCH", DEFAULT_BATCH)?,
            pull_interval: Duration::from_millis(pull_interval_ms),
            timeout: env_parse_opt::<u64>("JOBS_TIMEOUT_MS")?.map(Duration::from_millis),
            num_attempts: env_parse("JOBS_NUM_ATTEMPTS", DEFAULT_NUM_ATTEMPTS)?,
            delayed_poll: Duration::from_millis(env_parse(
                "JOBS_DELAYED_POLL_MS",
                DEFAULT_DELAYED_POLL_MS,
            )?),
            heartbeat: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
        })
    }
}

impl WorkerConfig {
    pub fn job_def(&self, perform: impl Perform + 'static) -> JobDef {
        let def = JobDef::new(self.stream.clone(), perform)
            .with_batch(self.batch)
            .with_pull_interval(self.pull_interval)
            .with_num_attempts(self.num_attempts);
        match self.timeout {
            Some(timeout) => def.with_timeout(timeout),
            None => def,
        }
    }

    pub fn delayed_poll(&self) -> DelayedPoll {
        DelayedPoll::new(self.stream.clone())
            .with_rule(Rule::every(self.delayed_poll))
            .with_exclusive(true)
    }
}
