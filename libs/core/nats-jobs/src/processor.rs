//! Job processor: hosts any number of job runners on one queue connection.

use crate::cancel::{CancelReason, CancelSignal};
use crate::config::JobDef;
use crate::error::JobsError;
use crate::event::{EventEmitter, JobEvent, WeakEventEmitter};
use crate::nats::NatsQueue;
use crate::queue::{JobQueue, Publisher};
use crate::runner::JobRunner;
use core_config::nats::NatsConfig;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Handle to a started job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    stream: String,
    stop: CancelSignal,
    done: watch::Receiver<bool>,
    events: WeakEventEmitter,
}

impl JobHandle {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Stop pulling, let the in-flight message settle and wait for the
    /// runner to exit. Calling it again just waits.
    pub async fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(stream = %self.stream, "Stopping job runner");
            self.events.emit(JobEvent::Stop {
                stream: self.stream.clone(),
            });
            self.stop.cancel(CancelReason::Stop);
        }
        self.stopped().await;
    }

    /// Resolves once the runner has exited.
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        // The sender is dropped when the runner task ends, which also counts.
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }
}

/// Runs jobs against a queue and broadcasts their lifecycle events.
///
/// # Example
///
/// ```rust,ignore
/// let processor = JobProcessor::connect(&NatsConfig::from_env()?).await?;
/// let mut events = processor.subscribe();
/// processor.start(JobDef::new("email", EmailPerform::new())).await?;
///
/// shutdown_signal().await;
/// processor.stop().await?;
/// ```
pub struct JobProcessor<Q: JobQueue = NatsQueue> {
    queue: Arc<Q>,
    events: EventEmitter,
    handles: Mutex<Vec<JobHandle>>,
}

impl JobProcessor<NatsQueue> {
    /// Connect to NATS and build a processor on that connection.
    pub async fn connect(config: &NatsConfig) -> Result<Self, JobsError> {
        let queue = NatsQueue::connect(config).await?;
        Ok(Self::new(queue))
    }
}

impl<Q: JobQueue> JobProcessor<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue: Arc::new(queue),
            events: EventEmitter::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Listen to events from every job started on this processor.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Publisher sharing this processor's connection.
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        self.queue.clone()
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Ensure the stream and consumer exist and start pulling.
    ///
    /// A failure to create the stream is logged and ignored, since the stream
    /// may be managed elsewhere. A failure to get or create the consumer is
    /// returned.
    pub async fn start(&self, def: JobDef) -> Result<JobHandle, JobsError> {
        let def = Arc::new(def);

        if let Err(e) = self.queue.ensure_stream(&def.stream_settings).await {
            warn!(stream = %def.stream, error = %e, "Failed to ensure stream");
        }

        let consumer = self
            .queue
            .ensure_consumer(&def.stream, &def.effective_consumer_settings())
            .await?;

        let stop = CancelSignal::new();
        let (done_tx, done_rx) = watch::channel(false);
        let runner = JobRunner::new(
            def.clone(),
            self.queue.clone(),
            consumer,
            self.events.clone(),
            stop.clone(),
        );
        tokio::spawn(runner.run(done_tx));

        let handle = JobHandle {
            stream: def.stream.clone(),
            stop,
            done: done_rx,
            events: self.events.downgrade(),
        };
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_stopped());
        handles.push(handle.clone());
        Ok(handle)
    }

    /// Number of jobs registered with this processor. Jobs stopped through
    /// their handle are dropped on the next [`start`](Self::start).
    pub fn jobs(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop every job, close the connection and detach listeners.
    pub async fn stop(self) -> Result<(), JobsError> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        info!(jobs = handles.len(), "Stopping job processor");

        join_all(handles.iter().map(|h| h.stop())).await;
        self.queue.close().await?;

        info!("Job processor stopped");
        Ok(())
    }
}
