//! Cooperative cancellation.
//!
//! A [`CancelSignal`] is fired at most once with a [`CancelReason`]. Children
//! observe their parent, so cancelling a runner's stop signal is visible to the
//! per-message signal handed to the handler, while a timeout on one message
//! does not leak into the next.

use futures::future::select_all;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::watch;

/// Why a signal was fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CancelReason {
    /// The runner is shutting down.
    Stop,
    /// The handler exceeded its time budget.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
    parent: Option<Box<CancelSignal>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            parent: None,
        }
    }

    /// Create a signal that also fires when `self` fires.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Fire the signal. Returns false if it had already been fired.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason this signal (or an ancestor) was fired with.
    pub fn reason(&self) -> Option<CancelReason> {
        self.lineage().find_map(|s| *s.tx.borrow())
    }

    /// Wait until the signal fires.
    pub async fn cancelled(&self) -> CancelReason {
        let mut receivers: Vec<_> = self.lineage().map(|s| s.tx.subscribe()).collect();
        loop {
            for rx in receivers.iter_mut() {
                if let Some(reason) = *rx.borrow_and_update() {
                    return reason;
                }
            }
            let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
            // Senders live as long as the signals, so this only fails during teardown.
            if select_all(changes).await.0.is_err() {
                return CancelReason::Stop;
            }
        }
    }

    fn lineage(&self) -> impl Iterator<Item = &CancelSignal> {
        std::iter::successors(Some(self), |s| s.parent.as_deref())
    }
}
