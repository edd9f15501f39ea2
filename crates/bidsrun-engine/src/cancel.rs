//! Cancellation token — created by the orchestrator, passed down to the
//! dispatchers. Setting it stops new unit dispatch immediately; running
//! units are terminated by their owning dispatcher.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation flag backed by a watch channel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns Err only if the sender is gone, which cannot
        // happen while any token clone is alive.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
