//! Work-queue abstraction.
//!
//! The engine only talks to the queue through these traits, so the NATS
//! adapter and the in-memory adapter are interchangeable.

use crate::config::{ConsumerSettings, StreamSettings};
use crate::error::JobsError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the publisher-supplied deduplication id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Delivery metadata of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageInfo {
    pub stream: String,
    pub consumer: String,
    pub subject: String,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// Number of times this message has been delivered, starting at 1.
    pub redelivery_count: u64,
    /// Messages still pending for the consumer.
    pub pending: u64,
}

/// The consumer settings that matter to a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub stream: String,
    pub durable_name: String,
    pub ack_wait: Duration,
    /// `-1` means unlimited.
    pub max_deliver: i64,
}

/// Result of a confirmed acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The server confirmed the ack.
    Confirmed,
    /// The ack could not be confirmed; the message may be redelivered.
    Unconfirmed(String),
}

impl AckOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, AckOutcome::Confirmed)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload and wait for the stream to persist it.
    ///
    /// Returns the stream sequence assigned to the message.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<String>,
    ) -> Result<u64, JobsError>;
}

/// A queue connection able to host job runners.
#[async_trait]
pub trait JobQueue: Publisher + 'static {
    /// Create the stream if it does not exist.
    async fn ensure_stream(&self, settings: &StreamSettings) -> Result<(), JobsError>;

    /// Get or create a durable pull consumer on `stream`.
    async fn ensure_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn PullConsumer>, JobsError>;

    /// Drain and close the connection.
    async fn close(&self) -> Result<(), JobsError>;
}

#[async_trait]
pub trait PullConsumer: Send + Sync {
    fn info(&self) -> &ConsumerSummary;

    /// Request up to `batch` messages, waiting at most `expires` for them.
    async fn pull(&self, batch: usize, expires: Duration) -> Result<Vec<JobMessage>, JobsError>;
}

/// Outcome operations on one delivered message.
#[async_trait]
pub trait MessageAcker: Send + Sync {
    /// Acknowledge and wait for the server to confirm.
    async fn ack_ack(&self) -> Result<AckOutcome, JobsError>;

    /// Request redelivery after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), JobsError>;

    /// Reset the ack-wait deadline.
    async fn working(&self) -> Result<(), JobsError>;
}

/// A delivered message.
#[derive(Clone)]
pub struct JobMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub info: MessageInfo,
    acker: Arc<dyn MessageAcker>,
}

impl fmt::Debug for JobMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("info", &self.info)
            .finish()
    }
}

impl JobMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: HashMap<String, String>,
        info: MessageInfo,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            info,
            acker,
        }
    }

    /// Acknowledge the message, waiting for confirmation.
    ///
    /// Transport errors are reported as [`AckOutcome::Unconfirmed`].
    pub async fn ack(&self) -> AckOutcome {
        match self.acker.ack_ack().await {
            Ok(outcome) => outcome,
            Err(e) => AckOutcome::Unconfirmed(e.to_string()),
        }
    }

    /// Negatively acknowledge, asking for redelivery after `delay`.
    pub async fn nak(&self, delay: Duration) -> Result<(), JobsError> {
        self.acker.nak(delay).await
    }

    /// Tell the server the message is still being worked on.
    pub async fn working(&self) -> Result<(), JobsError> {
        self.acker.working().await
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The deduplication id the message was published with, if any.
    pub fn msg_id(&self) -> Option<&str> {
        self.header(MSG_ID_HEADER)
    }

    /// Payload as UTF-8 text, if it is valid.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn is_redelivery(&self) -> bool {
        self.info.redelivery_count > 1
    }
}
