//! Job handler and recurring tasks of the worker.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::SecondsFormat;
use nats_jobs::{JobContext, JobMessage, Payload, Perform, PerformError, Recurring, Rule};
use std::time::Duration;
use tracing::info;

pub const HEARTBEAT_PREFIX: &str = "heartbeat";

/// Logs each message it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPerform;

#[async_trait]
impl Perform for LogPerform {
    async fn perform(&self, msg: &JobMessage, ctx: &JobContext) -> Result<(), PerformError> {
        ctx.check_cancelled()?;

        let text = msg.text().unwrap_or("<binary>");
        if text.starts_with(HEARTBEAT_PREFIX) {
            info!(subject = %msg.subject, payload = %text, "Heartbeat received");
        } else {
            info!(
                subject = %msg.subject,
                seq = msg.info.stream_sequence,
                attempt = msg.info.redelivery_count,
                bytes = msg.payload.len(),
                msg_id = ?msg.msg_id(),
                "Processing job"
            );
        }
        Ok(())
    }
}

/// Recurring heartbeat published onto `stream` every `period`.
///
/// The payload carries the tick, so every tick is a distinct message.
pub fn heartbeat(stream: &str, period: Duration) -> Recurring {
    Recurring::new(
        format!("{stream}-{HEARTBEAT_PREFIX}"),
        Rule::every(period),
        stream,
        Payload::from_fn(|tick| {
            Bytes::from(format!(
                "{HEARTBEAT_PREFIX} {}",
                tick.to_rfc3339_opts(SecondsFormat::Millis, true)
            ))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nats_jobs::{JobDef, JobEvent, JobProcessor, MemoryQueue, Publisher};

    #[test]
    fn test_heartbeat_payload_carries_tick() {
        let task = heartbeat("jobs", Duration::from_secs(60));
        let tick = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(task.id, "jobs-heartbeat");
        assert_eq!(task.subject, "jobs");
        assert_eq!(
            task.payload.at(tick),
            Bytes::from_static(b"heartbeat 2026-03-01T12:00:00.000Z")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_perform_completes_messages() {
        let processor = JobProcessor::new(MemoryQueue::new());
        let mut events = processor.subscribe();
        processor
            .start(JobDef::new("jobs", LogPerform))
            .await
            .unwrap();

        processor
            .publisher()
            .publish("jobs", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                JobEvent::Complete { info, .. } => {
                    assert_eq!(info.stream_sequence, 1);
                    break;
                }
                JobEvent::Error { error, .. } => panic!("unexpected failure: {error}"),
                _ => {}
            }
        }
        assert!(processor.queue().is_acked("jobs", "jobsConsumer", 1));
        processor.stop().await.unwrap();
    }
}
