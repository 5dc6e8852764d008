//! Error types for job processing and scheduling.

use crate::cancel::CancelReason;
use thiserror::Error;

/// Error that can occur in queue, lock store or scheduler operations.
#[derive(Debug, Error)]
pub enum JobsError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// JetStream error (stream management, info lookups)
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Consumer error (creation, pulls, acks)
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid schedule rule
    #[error("Invalid schedule rule '{rule}': {reason}")]
    Schedule { rule: String, reason: String },

    /// The connection has already been closed
    #[error("Connection closed")]
    Closed,
}

impl JobsError {
    /// Create a JetStream error from any displayable error.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a publish error.
    pub fn publish_error(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a consumer error.
    pub fn consumer_error(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }

    /// Whether the error points at an unreachable collaborator.
    pub fn is_connection_error(&self) -> bool {
        match self {
            JobsError::Connection(_) | JobsError::Closed => true,
            JobsError::Redis(e) => e.is_connection_dropped() || e.is_connection_refusal(),
            _ => false,
        }
    }
}

/// Error returned by a job handler.
///
/// Any failure results in a negative acknowledgment with backoff; the variant
/// only changes what gets reported on the `error` event.
#[derive(Debug, Error)]
pub enum PerformError {
    /// The handler gave up after observing its cancellation signal.
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    /// The handler failed.
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl PerformError {
    /// Create a failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure that wraps a source error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the handler stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PerformError::Cancelled(_))
    }
}

impl From<eyre::Report> for PerformError {
    fn from(report: eyre::Report) -> Self {
        Self::Failed {
            message: format!("{report:#}"),
            source: None,
        }
    }
}

impl From<JobsError> for PerformError {
    fn from(error: JobsError) -> Self {
        Self::with_source(error.to_string(), error)
    }
}
