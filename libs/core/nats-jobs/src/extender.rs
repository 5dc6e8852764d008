//! Keeps an in-flight message from being redelivered while its handler runs.

use crate::event::{EventEmitter, JobEvent};
use crate::queue::JobMessage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Fraction of the ack wait after which the deadline is extended.
pub const EXTEND_ACK_THRESHOLD_FACTOR: f64 = 0.75;

/// Periodically marks a message as being worked on. Stops when dropped.
#[derive(Debug)]
pub struct AckExtender {
    task: JoinHandle<()>,
}

impl AckExtender {
    /// Interval at which `working` is sent for the given ack wait.
    pub fn interval_for(ack_wait: Duration) -> Duration {
        ack_wait
            .mul_f64(EXTEND_ACK_THRESHOLD_FACTOR)
            .max(Duration::from_millis(1))
    }

    /// Start extending. The first extension happens one interval from now.
    pub fn start(msg: JobMessage, ack_wait: Duration, events: EventEmitter) -> Self {
        let period = Self::interval_for(ack_wait);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = msg.working().await {
                    warn!(
                        stream = %msg.info.stream,
                        stream_sequence = msg.info.stream_sequence,
                        error = %e,
                        "Failed to extend ack deadline"
                    );
                    continue;
                }
                events.emit(JobEvent::Working {
                    info: msg.info.clone(),
                });
            }
        });
        Self { task }
    }
}

impl Drop for AckExtender {
    fn drop(&mut self) {
        self.task.abort();
    }
}
