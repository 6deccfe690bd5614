//! Cooperative cancellation.
//!
//! Long-running operations (projection runs, groups, races) accept a
//! [`CancelToken`] and check it between events, never mid-callback. The
//! paired [`CancelHandle`] flips the signal. Both sides are cheap to clone
//! and share a `tokio::sync::watch` channel underneath.
//!
//! Dropping every handle counts as cancellation, so a worker whose
//! controller disappeared does not run forever.

use std::sync::Arc;

use tokio::sync::watch;

/// Create a connected cancellation pair.
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

/// Cancels the operations holding the paired tokens.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation has been signalled (or every handle dropped).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancellation is signalled or every handle is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the controller is gone; treat it the same
        // as an explicit cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
