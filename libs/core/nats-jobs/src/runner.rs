//! Pull loop for one job.

use crate::cancel::CancelSignal;
use crate::config::JobDef;
use crate::error::PerformError;
use crate::event::{EventEmitter, JobEvent};
use crate::extender::AckExtender;
use crate::perform::JobContext;
use crate::queue::{AckOutcome, JobMessage, JobQueue, Publisher, PullConsumer};
use crate::timeout::TimeoutCanceller;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Time left between a pull's expiry and the next tick.
const PULL_EXPIRY_MARGIN: Duration = Duration::from_millis(50);
const MIN_PULL_EXPIRY: Duration = Duration::from_millis(10);

/// How long a pull request may wait for messages.
pub fn pull_expiry(pull_interval: Duration) -> Duration {
    pull_interval
        .saturating_sub(PULL_EXPIRY_MARGIN)
        .max(MIN_PULL_EXPIRY)
}

pub(crate) struct JobRunner<Q: JobQueue> {
    def: Arc<JobDef>,
    queue: Arc<Q>,
    consumer: Box<dyn PullConsumer>,
    events: EventEmitter,
    stop: CancelSignal,
}

impl<Q: JobQueue> JobRunner<Q> {
    pub(crate) fn new(
        def: Arc<JobDef>,
        queue: Arc<Q>,
        consumer: Box<dyn PullConsumer>,
        events: EventEmitter,
        stop: CancelSignal,
    ) -> Self {
        Self {
            def,
            queue,
            consumer,
            events,
            stop,
        }
    }

    /// Run until the stop signal fires. `done` is set once the in-flight
    /// message has settled and no further pull will be issued.
    pub(crate) async fn run(self, done: watch::Sender<bool>) {
        let stream = self.def.stream.clone();
        let durable = self.consumer.info().durable_name.clone();
        let expires = pull_expiry(self.def.pull_interval);

        info!(
            stream = %stream,
            consumer = %durable,
            batch = self.def.batch,
            pull_interval_ms = self.def.pull_interval.as_millis() as u64,
            "Job runner started"
        );

        let mut ticker = tokio::time::interval(self.def.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'pull: loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break 'pull,
                _ = ticker.tick() => {}
            }

            self.events.emit(JobEvent::Pull {
                stream: stream.clone(),
                durable: durable.clone(),
                batch: self.def.batch,
                expires,
            });

            let messages = match self.consumer.pull(self.def.batch, expires).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Failed to pull messages");
                    continue;
                }
            };

            if !messages.is_empty() {
                debug!(stream = %stream, count = messages.len(), "Pulled messages");
            }

            for msg in messages {
                if self.stop.is_cancelled() {
                    break 'pull;
                }
                self.process(msg).await;
            }

            if self.stop.is_cancelled() {
                break 'pull;
            }
        }

        info!(stream = %stream, "Job runner stopped");
        let _ = done.send(true);
    }

    async fn process(&self, msg: JobMessage) {
        let info = msg.info.clone();
        let consumer = self.consumer.info();

        self.events.emit(JobEvent::Receive {
            info: info.clone(),
            consumer: consumer.clone(),
        });

        let signal = self.stop.child();
        let extender = self
            .def
            .auto_extend_ack_timeout
            .then(|| AckExtender::start(msg.clone(), consumer.ack_wait, self.events.clone()));
        let timeout = self.def.timeout.map(|t| {
            TimeoutCanceller::start(t, signal.clone(), info.clone(), self.events.clone())
        });

        let started = Instant::now();
        self.events.emit(JobEvent::Start { info: info.clone() });

        let ctx = JobContext {
            signal,
            def: self.def.clone(),
            publisher: self.queue.clone() as Arc<dyn Publisher>,
        };
        let outcome = AssertUnwindSafe(self.def.perform.perform(&msg, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PerformError::Panicked(panic_message(panic))));

        drop(extender);
        drop(timeout);
        let duration = started.elapsed();

        match outcome {
            Ok(()) => {
                let overage = self
                    .def
                    .expected
                    .and_then(|expected| duration.checked_sub(expected))
                    .filter(|over| !over.is_zero());
                info!(
                    stream = %info.stream,
                    subject = %info.subject,
                    stream_sequence = info.stream_sequence,
                    redelivery_count = info.redelivery_count,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                self.events.emit(JobEvent::Complete {
                    info: info.clone(),
                    duration,
                    overage,
                });

                if let AckOutcome::Unconfirmed(reason) = msg.ack().await {
                    warn!(
                        stream = %info.stream,
                        stream_sequence = info.stream_sequence,
                        reason = %reason,
                        "Ack not confirmed, message may be redelivered"
                    );
                    self.events.emit(JobEvent::NoAck { info, reason });
                }
            }
            Err(e) => {
                let backoff = self.def.backoff.next_backoff(info.redelivery_count);
                let attempts_exhausted = attempts_exhausted(info.redelivery_count, consumer.max_deliver);
                if attempts_exhausted {
                    error!(
                        stream = %info.stream,
                        stream_sequence = info.stream_sequence,
                        redelivery_count = info.redelivery_count,
                        error = %e,
                        "Job failed, attempts exhausted"
                    );
                } else {
                    warn!(
                        stream = %info.stream,
                        stream_sequence = info.stream_sequence,
                        redelivery_count = info.redelivery_count,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Job failed, will retry"
                    );
                }
                self.events.emit(JobEvent::Error {
                    info: info.clone(),
                    duration,
                    backoff,
                    attempts_exhausted,
                    error: e.to_string(),
                });

                if let Err(e) = msg.nak(backoff).await {
                    warn!(
                        stream = %info.stream,
                        stream_sequence = info.stream_sequence,
                        error = %e,
                        "Failed to nak message"
                    );
                }
            }
        }
    }
}

/// Whether a failed delivery was the last one the consumer allows.
pub fn attempts_exhausted(redelivery_count: u64, max_deliver: i64) -> bool {
    max_deliver > 0 && i64::try_from(redelivery_count).unwrap_or(i64::MAX) >= max_deliver
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_expiry() {
        assert_eq!(pull_expiry(Duration::from_secs(1)), Duration::from_millis(950));
        assert_eq!(pull_expiry(Duration::from_millis(40)), Duration::from_millis(10));
    }

    #[test]
    fn test_attempts_exhausted_only_at_max_deliver() {
        assert!(!attempts_exhausted(1, 3));
        assert!(!attempts_exhausted(2, 3));
        assert!(attempts_exhausted(3, 3));
        assert!(!attempts_exhausted(100, -1));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(7)), "unknown panic");
    }
}
