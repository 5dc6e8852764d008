//! Job, stream and consumer configuration.

use crate::backoff::Backoff;
use crate::perform::Perform;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// Default pull interval.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of messages requested per pull.
pub const DEFAULT_BATCH: usize = 10;
/// Default delivery attempts before a message is given up on.
pub const DEFAULT_NUM_ATTEMPTS: u32 = 5;
/// Default ack wait of the durable consumer.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(10);
/// Default maximum age of stream messages.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Retention {
    Limits,
    Interest,
    #[default]
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Storage {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Discard {
    #[default]
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Settings of the stream backing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub max_age: Duration,
    pub replicas: usize,
    pub discard: Discard,
    pub deny_delete: bool,
    pub deny_purge: bool,
    /// Window in which messages with the same `Nats-Msg-Id` are dropped.
    /// `None` leaves the server default.
    pub duplicate_window: Option<Duration>,
}

impl StreamSettings {
    /// Work-queue stream named `name` that captures the subject `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            subjects: vec![name.clone()],
            name,
            retention: Retention::default(),
            storage: Storage::default(),
            max_age: DEFAULT_MAX_AGE,
            replicas: 1,
            discard: Discard::default(),
            deny_delete: false,
            deny_purge: false,
            duplicate_window: None,
        }
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_discard(mut self, discard: Discard) -> Self {
        self.discard = discard;
        self
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = Some(window);
        self
    }
}

/// Settings of the durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub durable_name: String,
    /// `None` derives the value from the job's `num_attempts`.
    pub max_deliver: Option<i64>,
    pub ack_wait: Duration,
    pub deliver_policy: DeliverPolicy,
    pub replay_policy: ReplayPolicy,
    pub filter_subject: Option<String>,
}

impl ConsumerSettings {
    /// Consumer named `{stream}Consumer`.
    pub fn new(stream: &str) -> Self {
        Self {
            durable_name: format!("{stream}Consumer"),
            max_deliver: None,
            ack_wait: DEFAULT_ACK_WAIT,
            deliver_policy: DeliverPolicy::default(),
            replay_policy: ReplayPolicy::default(),
            filter_subject: None,
        }
    }

    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = name.into();
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }
}

/// Everything needed to run one job.
///
/// ```rust,ignore
/// let def = JobDef::new("email", perform_fn(|msg, _ctx| async move {
///     send(msg.payload).await?;
///     Ok(())
/// }))
/// .with_batch(20)
/// .with_timeout(Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct JobDef {
    pub stream: String,
    pub stream_settings: StreamSettings,
    pub consumer_settings: ConsumerSettings,
    pub pull_interval: Duration,
    pub batch: usize,
    pub backoff: Backoff,
    pub num_attempts: u32,
    /// Keep the message alive while the handler runs. When off, a handler
    /// slower than the consumer's ack wait gets the message redelivered and
    /// may run twice concurrently.
    pub auto_extend_ack_timeout: bool,
    /// Budget for one handler call; the handler is signalled, never aborted.
    pub timeout: Option<Duration>,
    /// Expected handler duration, only used to report overage.
    pub expected: Option<Duration>,
    pub perform: Arc<dyn Perform>,
}

impl fmt::Debug for JobDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDef")
            .field("stream", &self.stream)
            .field("stream_settings", &self.stream_settings)
            .field("consumer_settings", &self.consumer_settings)
            .field("pull_interval", &self.pull_interval)
            .field("batch", &self.batch)
            .field("backoff", &self.backoff)
            .field("num_attempts", &self.num_attempts)
            .field("auto_extend_ack_timeout", &self.auto_extend_ack_timeout)
            .field("timeout", &self.timeout)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl JobDef {
    pub fn new(stream: impl Into<String>, perform: impl Perform + 'static) -> Self {
        let stream = stream.into();
        Self {
            stream_settings: StreamSettings::new(&stream),
            consumer_settings: ConsumerSettings::new(&stream),
            stream,
            pull_interval: DEFAULT_PULL_INTERVAL,
            batch: DEFAULT_BATCH,
            backoff: Backoff::default(),
            num_attempts: DEFAULT_NUM_ATTEMPTS,
            auto_extend_ack_timeout: true,
            timeout: None,
            expected: None,
            perform: Arc::new(perform),
        }
    }

    /// Effective max-deliver of the consumer.
    pub fn max_deliver(&self) -> i64 {
        self.consumer_settings
            .max_deliver
            .unwrap_or(i64::from(self.num_attempts))
    }

    /// Consumer settings with the derived max-deliver filled in.
    pub fn effective_consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_deliver: Some(self.max_deliver()),
            ..self.consumer_settings.clone()
        }
    }

    pub fn with_stream_settings(mut self, settings: StreamSettings) -> Self {
        self.stream_settings = settings;
        self
    }

    pub fn with_consumer_settings(mut self, settings: ConsumerSettings) -> Self {
        self.consumer_settings = settings;
        self
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.consumer_settings.filter_subject = Some(subject.into());
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = backoff.into();
        self
    }

    pub fn with_num_attempts(mut self, attempts: u32) -> Self {
        self.num_attempts = attempts;
        self
    }

    pub fn with_auto_extend_ack_timeout(mut self, enabled: bool) -> Self {
        self.auto_extend_ack_timeout = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expected(mut self, expected: Duration) -> Self {
        self.expected = Some(expected);
        self
    }
}
