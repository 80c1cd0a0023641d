//! Process-wide stop signal for worker tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// A latch that, once triggered, stays triggered.
///
/// The flag answers "should I stop?" without awaiting; the watch channel lets
/// a task `select!` on the trigger at any suspension point.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Trip the latch. Returns `true` for the call that actually tripped it.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(reason, "shutdown triggered");
        self.tx.send_replace(true);
        true
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// The receiving end of a [`Shutdown`].
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once the latch is tripped (immediately if it already is).
    pub async fn wait(&mut self) {
        // The sender lives inside every `Shutdown` clone; an error means all
        // of them are gone, which is as good as a trigger.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_idempotent_and_wakes_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        let waiter = tokio::spawn(async move { signal.wait().await });

        assert!(shutdown.trigger("test"));
        assert!(!shutdown.trigger("again"));
        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Late subscribers see the trigger immediately.
        let mut late = shutdown.subscribe();
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .unwrap();
    }
}
