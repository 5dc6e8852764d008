//! Structured logging of job lifecycle events.

use nats_jobs::JobEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Log one event at a level matching its severity.
pub fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Complete {
            info,
            duration,
            overage,
        } => info!(
            stream = %info.stream,
            seq = info.stream_sequence,
            duration_ms = duration.as_millis() as u64,
            overage_ms = overage.map(|o| o.as_millis() as u64),
            "Job completed"
        ),
        JobEvent::Error {
            info,
            backoff,
            attempts_exhausted: true,
            error,
            ..
        } => error!(
            stream = %info.stream,
            seq = info.stream_sequence,
            attempt = info.redelivery_count,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Job failed on its last attempt"
        ),
        JobEvent::Error {
            info,
            backoff,
            error,
            ..
        } => warn!(
            stream = %info.stream,
            seq = info.stream_sequence,
            attempt = info.redelivery_count,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Job failed, retrying"
        ),
        JobEvent::Timeout { info, timeout } => warn!(
            stream = %info.stream,
            seq = info.stream_sequence,
            timeout_ms = timeout.as_millis() as u64,
            "Job timed out"
        ),
        JobEvent::NoAck { info, reason } => warn!(
            stream = %info.stream,
            seq = info.stream_sequence,
            reason = %reason,
            "Job completed but ack was not confirmed"
        ),
        JobEvent::Stop { stream } => info!(stream = %stream, "Job stopping"),
        other => debug!(event = other.name(), stream = %other.stream(), "Job event"),
    }
}

/// Log every event until the emitter is dropped.
pub fn spawn_event_logger(mut events: broadcast::Receiver<JobEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nats_jobs::{EventEmitter, MessageInfo};
    use std::time::Duration;

    #[tokio::test]
    async fn test_logger_exits_when_emitter_dropped() {
        let emitter = EventEmitter::new();
        let logger = spawn_event_logger(emitter.subscribe());

        emitter.emit(JobEvent::Complete {
            info: MessageInfo::default(),
            duration: Duration::from_millis(5),
            overage: None,
        });
        emitter.emit(JobEvent::Stop {
            stream: "jobs".to_string(),
        });
        drop(emitter);

        tokio::time::timeout(Duration::from_secs(1), logger)
            .await
            .expect("logger did not exit")
            .unwrap();
    }
}
