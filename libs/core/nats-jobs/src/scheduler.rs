//! Publishes messages in the future.
//!
//! Recurring tasks are evaluated by every scheduler process; a lock per tick
//! ensures only one of them publishes. One-shot delayed messages are parked in
//! a sorted set scored by due time and moved onto the queue by a poller.

use crate::cancel::{CancelReason, CancelSignal};
use crate::error::JobsError;
use crate::lock::{LockStore, LOCK_TTL};
use crate::metrics::JobMetrics;
use crate::queue::Publisher;
use crate::rule::Rule;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{join_all, try_join_all};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default interval at which delayed messages are polled.
pub const DEFAULT_DELAYED_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub fn scheduling_lock_key(id: &str, tick: DateTime<Utc>) -> String {
    format!("schedulingLock:{id}:{}", tick.timestamp_millis())
}

pub fn delayed_lock_key(subject: &str, tick: DateTime<Utc>) -> String {
    format!("delayedLock:{subject}:{}", tick.timestamp_millis())
}

pub fn delayed_set_key(subject: &str) -> String {
    format!("{subject}:delayed")
}

/// Message body of a recurring task.
#[derive(Clone)]
pub enum Payload {
    Static(Bytes),
    /// Computed from the tick time.
    Fn(Arc<dyn Fn(DateTime<Utc>) -> Bytes + Send + Sync>),
}

impl Payload {
    pub fn from_fn(f: impl Fn(DateTime<Utc>) -> Bytes + Send + Sync + 'static) -> Self {
        Payload::Fn(Arc::new(f))
    }

    pub fn at(&self, tick: DateTime<Utc>) -> Bytes {
        match self {
            Payload::Static(bytes) => bytes.clone(),
            Payload::Fn(f) => f(tick),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Static(bytes) => f.debug_tuple("Static").field(bytes).finish(),
            Payload::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Static(bytes)
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Payload::Static(Bytes::from_static(s.as_bytes()))
    }
}

/// A task published on every tick of its rule.
#[derive(Debug, Clone)]
pub struct Recurring {
    /// Unique across all scheduler processes sharing the lock store.
    pub id: String,
    pub rule: Rule,
    pub subject: String,
    pub payload: Payload,
}

impl Recurring {
    pub fn new(
        id: impl Into<String>,
        rule: Rule,
        subject: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            id: id.into(),
            rule,
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFor {
    At(DateTime<Utc>),
    In(Duration),
}

/// A message to publish once, at or after a point in time.
#[derive(Debug, Clone)]
pub struct Delayed {
    pub schedule_for: ScheduleFor,
    pub subject: String,
    pub payload: Bytes,
}

impl Delayed {
    pub fn at(when: DateTime<Utc>, subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            schedule_for: ScheduleFor::At(when),
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    pub fn after(delay: Duration, subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            schedule_for: ScheduleFor::In(delay),
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// Poller that moves due delayed messages for `subject` onto the queue.
#[derive(Debug, Clone)]
pub struct DelayedPoll {
    pub subject: String,
    pub rule: Rule,
    /// Let only one process poll per tick.
    pub exclusive: bool,
}

impl DelayedPoll {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            rule: Rule::Every(DEFAULT_DELAYED_POLL_INTERVAL),
            exclusive: false,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Wall clock that advances with the tokio clock.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + TimeDelta::from_std(self.instant.elapsed()).unwrap_or_default()
    }

    /// Time left until `when`, zero if it has passed.
    fn until(&self, when: DateTime<Utc>) -> Duration {
        (when - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

fn owner_token() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "scheduler".to_string());
    format!("{host}-{}-{}", std::process::id(), uuid::Uuid::new_v4())
}

struct Shared {
    publisher: Arc<dyn Publisher>,
    locks: Arc<dyn LockStore>,
    owner: String,
    clock: Clock,
}

impl Shared {
    /// With `max_lag` set, a tick won later than `max_lag` after it was due is
    /// dropped: its lock may have expired after another scheduler published it.
    async fn fire_recurring(
        &self,
        task: &Recurring,
        tick: DateTime<Utc>,
        max_lag: Option<Duration>,
    ) -> Result<bool, JobsError> {
        let key = scheduling_lock_key(&task.id, tick);
        if !self.locks.set_if_absent(&key, &self.owner, LOCK_TTL).await? {
            debug!(id = %task.id, tick = %tick, "Tick owned by another scheduler");
            return Ok(false);
        }
        if let Some(max_lag) = max_lag {
            let lag = (self.clock.now() - tick).to_std().unwrap_or(Duration::ZERO);
            if lag >= max_lag {
                warn!(id = %task.id, tick = %tick, lag = ?lag, "Dropping stale tick");
                return Ok(false);
            }
        }

        let sequence = self
            .publisher
            .publish(&task.subject, task.payload.at(tick), Some(key))
            .await?;
        JobMetrics::scheduled_published(&task.subject, "recurring");
        info!(
            id = %task.id,
            subject = %task.subject,
            tick = %tick,
            sequence,
            "Published recurring message"
        );
        Ok(true)
    }

    async fn poll_delayed(
        &self,
        subject: &str,
        tick: DateTime<Utc>,
        exclusive: bool,
    ) -> Result<usize, JobsError> {
        if exclusive
            && !self
                .locks
                .set_if_absent(&delayed_lock_key(subject, tick), &self.owner, LOCK_TTL)
                .await?
        {
            debug!(subject = %subject, tick = %tick, "Delayed poll owned by another scheduler");
            return Ok(0);
        }

        let key = delayed_set_key(subject);
        let upper = self.clock.now().timestamp_millis();
        let due = self.locks.sorted_set_range_by_score(&key, upper).await?;
        if due.is_empty() {
            return Ok(0);
        }

        // Removal only happens once everything was published, so a failure
        // here republishes the whole range on the next poll.
        try_join_all(
            due.iter()
                .map(|payload| self.publisher.publish(subject, payload.clone(), None)),
        )
        .await?;
        self.locks.sorted_set_remove_range_by_score(&key, upper).await?;

        for _ in &due {
            JobMetrics::scheduled_published(subject, "delayed");
        }
        info!(subject = %subject, count = due.len(), "Published delayed messages");
        Ok(due.len())
    }
}

/// Handle to a scheduled loop.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    name: String,
    signal: CancelSignal,
    done: watch::Receiver<bool>,
}

impl ScheduleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.signal.cancel(CancelReason::Stop);
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }
}

/// Recurring and delayed message scheduler.
///
/// ```rust,ignore
/// let scheduler = JobScheduler::new(processor.publisher(), Arc::new(locks));
/// scheduler.schedule_recurring(Recurring::new(
///     "nightly-report",
///     Rule::cron("0 0 2 * * *")?,
///     "reports",
///     "nightly",
/// ));
/// scheduler.publish_delayed(DelayedPoll::new("email"));
/// scheduler.schedule_delayed(Delayed::after(Duration::from_secs(3600), "email", "reminder")).await?;
/// ```
pub struct JobScheduler {
    shared: Arc<Shared>,
    shutdown: CancelSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(publisher: Arc<dyn Publisher>, locks: Arc<dyn LockStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                publisher,
                locks,
                owner: owner_token(),
                clock: Clock::new(),
            }),
            shutdown: CancelSignal::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Value written into the locks this scheduler acquires.
    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    /// Current time as seen by the scheduler.
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Publish `task` on every tick of its rule, unless another scheduler
    /// already took the tick.
    pub fn schedule_recurring(&self, task: Recurring) -> ScheduleHandle {
        info!(id = %task.id, subject = %task.subject, "Scheduling recurring task");
        let shared = self.shared.clone();
        let task = Arc::new(task);
        let rule = task.rule.clone();
        let name = task.id.clone();
        self.spawn_loop(name, rule, move |tick| {
            let shared = shared.clone();
            let task = task.clone();
            async move {
                if let Err(e) = shared.fire_recurring(&task, tick, Some(LOCK_TTL)).await {
                    warn!(id = %task.id, tick = %tick, error = %e, "Failed to fire recurring task");
                }
            }
        })
    }

    /// Run one tick of a recurring task, however old. Returns true if this
    /// call published.
    pub async fn fire_recurring(&self, task: &Recurring, tick: DateTime<Utc>) -> Result<bool, JobsError> {
        self.shared.fire_recurring(task, tick, None).await
    }

    /// Park a message until it is due. Returns true if it was newly added;
    /// an identical payload already waiting only has its due time updated.
    pub async fn schedule_delayed(&self, delayed: Delayed) -> Result<bool, JobsError> {
        let due = match delayed.schedule_for {
            ScheduleFor::At(when) => when,
            ScheduleFor::In(delay) => TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| self.now().checked_add_signed(delay))
                .ok_or_else(|| JobsError::Schedule {
                    rule: format!("in {delay:?}"),
                    reason: "delay out of range".to_string(),
                })?,
        };
        let added = self
            .shared
            .locks
            .sorted_set_add(
                &delayed_set_key(&delayed.subject),
                due.timestamp_millis(),
                &delayed.payload,
            )
            .await?;
        debug!(subject = %delayed.subject, due = %due, added = added == 1, "Scheduled delayed message");
        Ok(added == 1)
    }

    /// Periodically publish the due delayed messages of a subject.
    pub fn publish_delayed(&self, poll: DelayedPoll) -> ScheduleHandle {
        info!(subject = %poll.subject, exclusive = poll.exclusive, "Polling delayed messages");
        let shared = self.shared.clone();
        let name = format!("delayed:{}", poll.subject);
        let subject: Arc<str> = poll.subject.into();
        let exclusive = poll.exclusive;
        self.spawn_loop(name, poll.rule, move |tick| {
            let shared = shared.clone();
            let subject = subject.clone();
            async move {
                if let Err(e) = shared.poll_delayed(&subject, tick, exclusive).await {
                    warn!(subject = %subject, error = %e, "Failed to publish delayed messages");
                }
            }
        })
    }

    /// Run one delayed poll. Returns the number of messages published.
    pub async fn poll_delayed(
        &self,
        subject: &str,
        tick: DateTime<Utc>,
        exclusive: bool,
    ) -> Result<usize, JobsError> {
        self.shared.poll_delayed(subject, tick, exclusive).await
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn stop(self) {
        self.shutdown.cancel(CancelReason::Stop);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Schedule loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    fn spawn_loop<F, Fut>(&self, name: String, rule: Rule, mut on_tick: F) -> ScheduleHandle
    where
        F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = self.shutdown.child();
        let (done_tx, done_rx) = watch::channel(false);
        let clock = self.shared.clock;

        let task = tokio::spawn({
            let signal = signal.clone();
            let name = name.clone();
            async move {
                let mut after = clock.now();
                while let Some(tick) = rule.next_after(after) {
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => break,
                        _ = tokio::time::sleep(clock.until(tick)) => {}
                    }
                    on_tick(tick).await;
                    // Ticks missed while on_tick ran are skipped, not replayed.
                    after = tick.max(clock.now());
                }
                debug!(name = %name, "Schedule loop exited");
                let _ = done_tx.send(true);
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);

        ScheduleHandle {
            name,
            signal,
            done: done_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamSettings;
    use crate::memory::{MemoryLockStore, MemoryQueue};
    use crate::queue::{JobQueue, MockPublisher};
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn queue_with(subjects: &[&str]) -> MemoryQueue {
        let queue = MemoryQueue::new();
        for subject in subjects {
            queue.ensure_stream(&StreamSettings::new(*subject)).await.unwrap();
        }
        queue
    }

    fn tick(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_keys() {
        assert_eq!(scheduling_lock_key("report", tick(1_000)), "schedulingLock:report:1000");
        assert_eq!(delayed_lock_key("email", tick(5_000)), "delayedLock:email:5000");
        assert_eq!(delayed_set_key("email"), "email:delayed");
    }

    #[test]
    fn test_payload_fn_uses_tick() {
        let payload = Payload::from_fn(|t| Bytes::from(t.timestamp_millis().to_string()));
        assert_eq!(payload.at(tick(42)), Bytes::from_static(b"42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_schedulers_publish_each_tick_once() {
        let queue = queue_with(&["report"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let schedulers: Vec<_> = (0..8)
            .map(|_| JobScheduler::new(Arc::new(queue.clone()), locks.clone()))
            .collect();
        let task = Recurring::new("report", Rule::every(Duration::from_secs(1)), "report", "run");

        for ms in [1_000, 2_000, 3_000] {
            let results = join_all(schedulers.iter().map(|s| s.fire_recurring(&task, tick(ms)))).await;
            let winners = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
            assert_eq!(winners, 1);
        }
        assert_eq!(queue.published("report").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_loops_publish_once_per_tick() {
        let queue = queue_with(&["report"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let task = Recurring::new("report", Rule::every(Duration::from_secs(1)), "report", "run");

        let a = JobScheduler::new(Arc::new(queue.clone()), locks.clone());
        let b = JobScheduler::new(Arc::new(queue.clone()), locks.clone());
        a.schedule_recurring(task.clone());
        b.schedule_recurring(task);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        a.stop().await;
        b.stop().await;

        let published = queue.published("report").len();
        assert!((5..=6).contains(&published), "published {published}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_scheduler_does_not_replay_missed_ticks() {
        struct StallingLocks {
            inner: MemoryLockStore,
            stalled: AtomicBool,
        }

        #[async_trait::async_trait]
        impl LockStore for StallingLocks {
            async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, JobsError> {
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(90)).await;
                }
                self.inner.set_if_absent(key, value, ttl).await
            }
            async fn sorted_set_add(&self, key: &str, score: i64, member: &[u8]) -> Result<u64, JobsError> {
                self.inner.sorted_set_add(key, score, member).await
            }
            async fn sorted_set_range_by_score(&self, key: &str, upper: i64) -> Result<Vec<Bytes>, JobsError> {
                self.inner.sorted_set_range_by_score(key, upper).await
            }
            async fn sorted_set_remove_range_by_score(&self, key: &str, upper: i64) -> Result<u64, JobsError> {
                self.inner.sorted_set_remove_range_by_score(key, upper).await
            }
        }

        let queue = MemoryQueue::new();
        queue
            .ensure_stream(&StreamSettings::new("report").with_duplicate_window(Duration::from_millis(500)))
            .await
            .unwrap();
        let locks = MemoryLockStore::new();
        let stalling = StallingLocks {
            inner: locks.clone(),
            stalled: AtomicBool::new(false),
        };
        let task = Recurring::new(
            "report",
            Rule::every(Duration::from_secs(1)),
            "report",
            Payload::from_fn(|t| Bytes::from(t.timestamp_millis().to_string())),
        );

        let a = JobScheduler::new(Arc::new(queue.clone()), Arc::new(stalling));
        let b = JobScheduler::new(Arc::new(queue.clone()), Arc::new(locks));
        a.schedule_recurring(task.clone());
        b.schedule_recurring(task);

        tokio::time::sleep(Duration::from_secs(100)).await;
        a.stop().await;
        b.stop().await;

        let published = queue.published("report");
        let ticks: HashSet<_> = published.iter().collect();
        assert_eq!(ticks.len(), published.len(), "a tick was published twice");
        assert!((99..=100).contains(&published.len()), "published {}", published.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_handle_stops_loop() {
        let queue = queue_with(&["report"]).await;
        let scheduler = JobScheduler::new(Arc::new(queue.clone()), Arc::new(MemoryLockStore::new()));
        let handle = scheduler.schedule_recurring(Recurring::new(
            "report",
            Rule::every(Duration::from_secs(1)),
            "report",
            "run",
        ));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.stop().await;
        assert!(handle.is_stopped());
        let published = queue.published("report").len();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.published("report").len(), published);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_store_failure_skips_publish() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        struct FailingLocks;
        #[async_trait::async_trait]
        impl LockStore for FailingLocks {
            async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, JobsError> {
                Err(JobsError::Closed)
            }
            async fn sorted_set_add(&self, _: &str, _: i64, _: &[u8]) -> Result<u64, JobsError> {
                Err(JobsError::Closed)
            }
            async fn sorted_set_range_by_score(&self, _: &str, _: i64) -> Result<Vec<Bytes>, JobsError> {
                Err(JobsError::Closed)
            }
            async fn sorted_set_remove_range_by_score(&self, _: &str, _: i64) -> Result<u64, JobsError> {
                Err(JobsError::Closed)
            }
        }

        let scheduler = JobScheduler::new(Arc::new(publisher), Arc::new(FailingLocks));
        let task = Recurring::new("report", Rule::every(Duration::from_secs(1)), "report", "run");
        assert!(scheduler.fire_recurring(&task, tick(1_000)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_delayed_dedupes_payload() {
        let queue = queue_with(&["email"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let scheduler = JobScheduler::new(Arc::new(queue), locks.clone());

        let delayed = Delayed::after(Duration::from_secs(60), "email", Bytes::from_static(b"hi"));
        assert!(scheduler.schedule_delayed(delayed.clone()).await.unwrap());
        assert!(!scheduler.schedule_delayed(delayed).await.unwrap());
        assert_eq!(locks.sorted_set_len("email:delayed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_delayed_publishes_only_due_messages() {
        let queue = queue_with(&["email"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let scheduler = JobScheduler::new(Arc::new(queue.clone()), locks.clone());
        let now = scheduler.now();

        scheduler
            .schedule_delayed(Delayed::at(now - TimeDelta::seconds(1), "email", Bytes::from_static(b"past")))
            .await
            .unwrap();
        scheduler
            .schedule_delayed(Delayed::after(Duration::from_secs(30), "email", Bytes::from_static(b"later")))
            .await
            .unwrap();

        assert_eq!(scheduler.poll_delayed("email", now, false).await.unwrap(), 1);
        assert_eq!(queue.published("email"), vec![Bytes::from_static(b"past")]);
        assert_eq!(locks.sorted_set_len("email:delayed"), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(scheduler.poll_delayed("email", scheduler.now(), false).await.unwrap(), 1);
        assert_eq!(locks.sorted_set_len("email:delayed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_poll_runs_once_per_tick() {
        let queue = queue_with(&["email"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let a = JobScheduler::new(Arc::new(queue.clone()), locks.clone());
        let b = JobScheduler::new(Arc::new(queue.clone()), locks.clone());

        let now = a.now();
        a.schedule_delayed(Delayed::at(now, "email", Bytes::from_static(b"x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let t = tick(now.timestamp_millis());
        assert_eq!(b.poll_delayed("email", t, true).await.unwrap(), 1);
        a.schedule_delayed(Delayed::at(now, "email", Bytes::from_static(b"y")))
            .await
            .unwrap();
        assert_eq!(a.poll_delayed("email", t, true).await.unwrap(), 0);
        assert_eq!(queue.published("email").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delayed_publish_is_retried() {
        let locks = Arc::new(MemoryLockStore::new());
        let mut publisher = MockPublisher::new();
        let mut seq = mockall::Sequence::new();
        publisher
            .expect_publish()
            .withf(|subject, payload, msg_id| {
                subject == "email" && payload == &Bytes::from_static(b"x") && msg_id.is_none()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(JobsError::publish_error("no responders")));
        publisher
            .expect_publish()
            .withf(|subject, payload, msg_id| {
                subject == "email" && payload == &Bytes::from_static(b"x") && msg_id.is_none()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(1));

        let scheduler = JobScheduler::new(Arc::new(publisher), locks.clone());
        let now = scheduler.now();
        scheduler
            .schedule_delayed(Delayed::at(now, "email", Bytes::from_static(b"x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(scheduler.poll_delayed("email", now, false).await.is_err());
        assert_eq!(locks.sorted_set_len("email:delayed"), 1);

        assert_eq!(scheduler.poll_delayed("email", now, false).await.unwrap(), 1);
        assert_eq!(locks.sorted_set_len("email:delayed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_delayed_loop_drains_due_messages() {
        let queue = queue_with(&["email"]).await;
        let locks = Arc::new(MemoryLockStore::new());
        let scheduler = JobScheduler::new(Arc::new(queue.clone()), locks.clone());

        scheduler
            .schedule_delayed(Delayed::after(Duration::from_secs(3), "email", Bytes::from_static(b"x")))
            .await
            .unwrap();
        scheduler.publish_delayed(DelayedPoll::new("email").with_rule(Rule::every(Duration::from_secs(1))));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.published("email").is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.published("email"), vec![Bytes::from_static(b"x")]);
        scheduler.stop().await;
    }
}
