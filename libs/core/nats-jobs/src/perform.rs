//! Job handler trait.

use crate::cancel::CancelSignal;
use crate::config::JobDef;
use crate::error::PerformError;
use crate::queue::{JobMessage, Publisher};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// What a handler gets besides the message.
#[derive(Clone)]
pub struct JobContext {
    /// Fired on timeout or shutdown. Handlers should poll or await it and
    /// bail out with [`PerformError::Cancelled`].
    pub signal: CancelSignal,
    pub def: Arc<JobDef>,
    /// Publishes on the processor's connection.
    pub publisher: Arc<dyn Publisher>,
}

impl JobContext {
    /// Return early if the signal has fired.
    pub fn check_cancelled(&self) -> Result<(), PerformError> {
        match self.signal.reason() {
            Some(reason) => Err(PerformError::Cancelled(reason)),
            None => Ok(()),
        }
    }
}

/// Job handler.
///
/// Returning an error naks the message with the job's backoff. Handlers may
/// call [`JobMessage::working`] themselves to hold the message longer than
/// the ack wait.
///
/// # Example
///
/// ```rust,ignore
/// struct Resize { store: Arc<ImageStore> }
///
/// #[async_trait]
/// impl Perform for Resize {
///     async fn perform(&self, msg: &JobMessage, ctx: &JobContext) -> Result<(), PerformError> {
///         let id = msg.text().ok_or_else(|| PerformError::failed("invalid id"))?;
///         ctx.check_cancelled()?;
///         self.store.resize(id).await.map_err(|e| PerformError::with_source("resize", e))
///     }
/// }
/// ```
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, msg: &JobMessage, ctx: &JobContext) -> Result<(), PerformError>;
}

/// Handler built from a closure, see [`perform_fn`].
pub struct PerformFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Perform`] implementation.
pub fn perform_fn<F, Fut>(f: F) -> PerformFn<F>
where
    F: Fn(JobMessage, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PerformError>> + Send,
{
    PerformFn { f }
}

#[async_trait]
impl<F, Fut> Perform for PerformFn<F>
where
    F: Fn(JobMessage, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PerformError>> + Send,
{
    async fn perform(&self, msg: &JobMessage, ctx: &JobContext) -> Result<(), PerformError> {
        (self.f)(msg.clone(), ctx.clone()).await
    }
}

#[async_trait]
impl<T: Perform + ?Sized> Perform for Arc<T> {
    async fn perform(&self, msg: &JobMessage, ctx: &JobContext) -> Result<(), PerformError> {
        (**self).perform(msg, ctx).await
    }
}
