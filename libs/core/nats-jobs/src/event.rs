//! Lifecycle events emitted by job runners.

use crate::metrics::JobMetrics;
use crate::queue::{ConsumerSummary, MessageInfo};
use std::time::Duration;
use strum::IntoStaticStr;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event channel; slow listeners lag rather than block runners.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum JobEvent {
    /// The handler is about to be invoked.
    Start { info: MessageInfo },
    /// A message was pulled from the consumer.
    Receive {
        info: MessageInfo,
        consumer: ConsumerSummary,
    },
    /// The ack deadline was extended.
    Working { info: MessageInfo },
    /// The handler succeeded.
    Complete {
        info: MessageInfo,
        duration: Duration,
        /// How far the run went past the expected duration.
        overage: Option<Duration>,
    },
    /// The handler failed and the message was scheduled for redelivery.
    Error {
        info: MessageInfo,
        duration: Duration,
        backoff: Duration,
        attempts_exhausted: bool,
        error: String,
    },
    /// The handler exceeded its timeout and was signalled.
    Timeout { info: MessageInfo, timeout: Duration },
    /// A pull request was issued.
    Pull {
        stream: String,
        durable: String,
        batch: usize,
        expires: Duration,
    },
    /// The runner was asked to stop.
    Stop { stream: String },
    /// A successful run could not be acknowledged.
    NoAck { info: MessageInfo, reason: String },
}

impl JobEvent {
    /// Event name: `start`, `receive`, `working`, `complete`, `error`,
    /// `timeout`, `pull`, `stop` or `noAck`.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// The stream the event belongs to.
    pub fn stream(&self) -> &str {
        match self {
            JobEvent::Start { info }
            | JobEvent::Receive { info, .. }
            | JobEvent::Working { info }
            | JobEvent::Complete { info, .. }
            | JobEvent::Error { info, .. }
            | JobEvent::Timeout { info, .. }
            | JobEvent::NoAck { info, .. } => &info.stream,
            JobEvent::Pull { stream, .. } | JobEvent::Stop { stream } => stream,
        }
    }

    pub fn info(&self) -> Option<&MessageInfo> {
        match self {
            JobEvent::Start { info }
            | JobEvent::Receive { info, .. }
            | JobEvent::Working { info }
            | JobEvent::Complete { info, .. }
            | JobEvent::Error { info, .. }
            | JobEvent::Timeout { info, .. }
            | JobEvent::NoAck { info, .. } => Some(info),
            JobEvent::Pull { .. } | JobEvent::Stop { .. } => None,
        }
    }
}

/// Fan-out of [`JobEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Log, record and broadcast an event. Having no listeners is fine.
    pub fn emit(&self, event: JobEvent) {
        let seq = event.info().map(|i| i.stream_sequence);
        debug!(
            event = event.name(),
            stream = %event.stream(),
            stream_sequence = ?seq,
            "Job event"
        );
        JobMetrics::record(&event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// A handle that emits without keeping listeners attached.
    pub fn downgrade(&self) -> WeakEventEmitter {
        WeakEventEmitter {
            tx: self.tx.downgrade(),
        }
    }
}

/// Emitter that stops delivering once every [`EventEmitter`] is dropped.
#[derive(Debug, Clone)]
pub struct WeakEventEmitter {
    tx: broadcast::WeakSender<JobEvent>,
}

impl WeakEventEmitter {
    pub fn emit(&self, event: JobEvent) {
        if let Some(tx) = self.tx.upgrade() {
            EventEmitter { tx }.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MessageInfo {
        MessageInfo {
            stream: "email".to_string(),
            stream_sequence: 7,
            redelivery_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(JobEvent::Start { info: info() }.name(), "start");
        assert_eq!(JobEvent::Working { info: info() }.name(), "working");
        assert_eq!(
            JobEvent::NoAck {
                info: info(),
                reason: "timeout".to_string()
            }
            .name(),
            "noAck"
        );
        assert_eq!(
            JobEvent::Stop {
                stream: "email".to_string()
            }
            .name(),
            "stop"
        );
    }

    #[test]
    fn test_event_stream() {
        let pull = JobEvent::Pull {
            stream: "email".to_string(),
            durable: "emailConsumer".to_string(),
            batch: 10,
            expires: Duration::from_millis(950),
        };
        assert_eq!(pull.stream(), "email");
        assert!(pull.info().is_none());
        assert_eq!(JobEvent::Start { info: info() }.info().map(|i| i.stream_sequence), Some(7));
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(JobEvent::Start { info: info() });
        assert_eq!(rx.recv().await.unwrap(), JobEvent::Start { info: info() });
    }

    #[tokio::test]
    async fn test_weak_emitter_does_not_keep_channel_open() {
        let emitter = EventEmitter::new();
        let weak = emitter.downgrade();
        let mut rx = emitter.subscribe();

        weak.emit(JobEvent::Stop {
            stream: "email".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "stop");

        drop(emitter);
        weak.emit(JobEvent::Stop {
            stream: "email".to_string(),
        });
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
