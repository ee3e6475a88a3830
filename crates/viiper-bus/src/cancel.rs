//! Watch-channel-backed cancellation scopes.
//!
//! One scope per device (and one per bus) fans out to every task serving it:
//! the URB loop, the feeder stream and the idle timer all clone the scope
//! and select on [`CancelScope::cancelled`]. Cancellation is idempotent and
//! sticky.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelScope {
    tx: watch::Sender<bool>,
}

impl CancelScope {
    pub fn new() -> CancelScope {
        let (tx, _) = watch::channel(false);
        CancelScope { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Resolves once the scope is cancelled; immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for returns early on the current value, and the sender half
        // living in self keeps the channel open for as long as the scope.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}
