//! Signals a handler that ran past its time budget.

use crate::cancel::{CancelReason, CancelSignal};
use crate::event::{EventEmitter, JobEvent};
use crate::queue::MessageInfo;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Fires a cancel signal after a timeout unless dropped first.
#[derive(Debug)]
pub struct TimeoutCanceller {
    task: JoinHandle<()>,
}

impl TimeoutCanceller {
    pub fn start(
        timeout: Duration,
        signal: CancelSignal,
        info: MessageInfo,
        events: EventEmitter,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if signal.cancel(CancelReason::Timeout) {
                warn!(
                    stream = %info.stream,
                    stream_sequence = info.stream_sequence,
                    timeout_ms = timeout.as_millis() as u64,
                    "Job timed out"
                );
                events.emit(JobEvent::Timeout { info, timeout });
            }
        });
        Self { task }
    }
}

impl Drop for TimeoutCanceller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
