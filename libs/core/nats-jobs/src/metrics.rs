//! Metrics for job runners and the scheduler.
//!
//! Recording goes through the `metrics` facade; installing an exporter is up
//! to the binary.

use crate::event::JobEvent;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub struct JobMetrics;

impl JobMetrics {
    /// Record the metrics that correspond to a lifecycle event.
    pub fn record(event: &JobEvent) {
        let stream = event.stream().to_string();
        match event {
            JobEvent::Receive { .. } => {
                counter!("nats_jobs_messages_received_total", "stream" => stream).increment(1);
            }
            JobEvent::Complete { duration, .. } => {
                counter!("nats_jobs_messages_completed_total", "stream" => stream.clone())
                    .increment(1);
                histogram!(
                    "nats_jobs_duration_seconds",
                    "stream" => stream,
                    "status" => "success"
                )
                .record(duration.as_secs_f64());
            }
            JobEvent::Error {
                duration,
                attempts_exhausted,
                ..
            } => {
                counter!("nats_jobs_messages_failed_total", "stream" => stream.clone())
                    .increment(1);
                if *attempts_exhausted {
                    counter!("nats_jobs_messages_exhausted_total", "stream" => stream.clone())
                        .increment(1);
                }
                histogram!(
                    "nats_jobs_duration_seconds",
                    "stream" => stream,
                    "status" => "failed"
                )
                .record(duration.as_secs_f64());
            }
            JobEvent::Timeout { .. } => {
                counter!("nats_jobs_timeouts_total", "stream" => stream).increment(1);
            }
            JobEvent::NoAck { .. } => {
                counter!("nats_jobs_no_ack_total", "stream" => stream).increment(1);
            }
            JobEvent::Working { .. } => {
                counter!("nats_jobs_working_total", "stream" => stream).increment(1);
            }
            JobEvent::Pull { .. } => {
                counter!("nats_jobs_pulls_total", "stream" => stream).increment(1);
            }
            JobEvent::Start { .. } | JobEvent::Stop { .. } => {}
        }
    }

    /// Record a message published by the scheduler.
    pub fn scheduled_published(subject: &str, kind: &'static str) {
        counter!(
            "nats_jobs_scheduled_published_total",
            "subject" => subject.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Register descriptions with the installed recorder.
    pub fn describe() {
        describe_counter!(
            "nats_jobs_messages_received_total",
            "Messages pulled from a job consumer"
        );
        describe_counter!(
            "nats_jobs_messages_completed_total",
            "Messages handled successfully"
        );
        describe_counter!(
            "nats_jobs_messages_failed_total",
            "Handler failures, each followed by a nak"
        );
        describe_counter!(
            "nats_jobs_messages_exhausted_total",
            "Failures on the last allowed delivery"
        );
        describe_counter!("nats_jobs_timeouts_total", "Handlers signalled after their timeout");
        describe_counter!("nats_jobs_no_ack_total", "Successful runs whose ack was not confirmed");
        describe_counter!("nats_jobs_working_total", "Ack deadline extensions");
        describe_counter!("nats_jobs_pulls_total", "Pull requests issued");
        describe_counter!(
            "nats_jobs_scheduled_published_total",
            "Messages published by the scheduler"
        );
        describe_histogram!(
            "nats_jobs_duration_seconds",
            Unit::Seconds,
            "Handler run time"
        );
    }
}
