//! Background jobs on NATS JetStream.
//!
//! A [`JobProcessor`] runs one pull loop per [`JobDef`]: messages are pulled
//! in batches and handed to the job's [`Perform`] implementation one at a
//! time. While a handler runs its ack deadline is extended; on success the
//! message is acked with server confirmation, on failure it is naked with the
//! job's [`Backoff`]. An optional timeout signals the handler through its
//! [`CancelSignal`] without aborting it.
//!
//! The [`JobScheduler`] publishes messages later: recurring tasks take a
//! per-tick lock in Redis so that only one scheduler process publishes each
//! tick, and one-shot delayed messages wait in a Redis sorted set until a
//! poller moves them onto the stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_jobs::{perform_fn, JobDef, JobProcessor};
//!
//! let processor = JobProcessor::connect(&NatsConfig::from_env()?).await?;
//! processor
//!     .start(JobDef::new("email", perform_fn(|msg, ctx| async move {
//!         ctx.check_cancelled()?;
//!         deliver(&msg.payload).await?;
//!         Ok(())
//!     })))
//!     .await?;
//! ```

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod extender;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod nats;
pub mod perform;
pub mod processor;
pub mod queue;
pub mod redis;
pub mod rule;
mod runner;
pub mod scheduler;
pub mod timeout;

pub use backoff::{exp_backoff, Backoff, ExpBackoffOptions};
pub use cancel::{CancelReason, CancelSignal};
pub use config::{ConsumerSettings, JobDef, StreamSettings};
pub use error::{JobsError, PerformError};
pub use event::{EventEmitter, JobEvent};
pub use lock::LockStore;
pub use memory::{MemoryLockStore, MemoryQueue};
pub use nats::NatsQueue;
pub use perform::{perform_fn, JobContext, Perform};
pub use processor::{JobHandle, JobProcessor};
pub use queue::{AckOutcome, ConsumerSummary, JobMessage, JobQueue, MessageInfo, Publisher};
pub use crate::redis::RedisLockStore;
pub use rule::Rule;
pub use runner::{attempts_exhausted, pull_expiry};
pub use scheduler::{Delayed, DelayedPoll, JobScheduler, Payload, Recurring, ScheduleFor, ScheduleHandle};
