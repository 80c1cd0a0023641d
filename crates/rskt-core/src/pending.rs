//! Sequence-number correlation for in-flight requests.
//!
//! A caller registers *before* its request is handed to the channel, so a
//! response can never arrive ahead of its waiter. The returned
//! [`PendingGuard`] removes the entry when dropped; removal and resolution
//! both happen under the registry lock, so a late response either reaches
//! the waiter or finds nothing, never a half-abandoned entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Response, RsktError};

pub type Outcome = Result<Response, RsktError>;

struct Table {
    waiters: HashMap<u32, oneshot::Sender<Outcome>>,
    closed: bool,
}

/// Waiting callers keyed by sequence number.
pub struct PendingRegistry {
    next_seq: AtomicU32,
    table: Mutex<Table>,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU32::new(1),
            table: Mutex::new(Table {
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Reserve a sequence number and a slot for its response.
    ///
    /// Sequence numbers wrap; a number still in flight is skipped. Fails with
    /// `ConnectionReset` once the registry has been drained.
    pub fn register(self: &Arc<Self>) -> Result<(PendingGuard, oneshot::Receiver<Outcome>), RsktError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.closed {
            return Err(RsktError::ConnectionReset);
        }
        if table.waiters.len() == u32::MAX as usize {
            return Err(RsktError::Exhausted(crate::Resource::ControlQueue));
        }
        let seq = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if !table.waiters.contains_key(&seq) {
                break seq;
            }
        };
        table.waiters.insert(seq, tx);
        drop(table);
        Ok((
            PendingGuard {
                registry: Arc::clone(self),
                seq,
            },
            rx,
        ))
    }

    /// Hand a response to its waiter. Returns `false` if nobody is waiting.
    pub fn resolve(&self, seq: u32, outcome: Outcome) -> bool {
        let waiter = self.table.lock().waiters.remove(&seq);
        match waiter {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Resolve every waiter with `ConnectionReset` and refuse new ones.
    ///
    /// Returns how many waiters were resolved. Idempotent.
    pub fn drain(&self) -> usize {
        let waiters: Vec<_> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.waiters.drain().collect()
        };
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(RsktError::ConnectionReset));
        }
        count
    }

    pub fn is_drained(&self) -> bool {
        self.table.lock().closed
    }

    /// Number of callers currently waiting.
    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a registry entry alive; dropping it abandons the wait.
#[must_use]
pub struct PendingGuard {
    registry: Arc<PendingRegistry>,
    seq: u32,
}

impl PendingGuard {
    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.table.lock().waiters.remove(&self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Reply, Request};

    fn bind_ok(sn: u32) -> Response {
        Response::ok(Request::Bind { sn }, Reply::Bind { sn })
    }

    #[tokio::test]
    async fn test_resolve_wakes_matching_waiter() {
        let registry = Arc::new(PendingRegistry::new());
        let (g1, rx1) = registry.register().unwrap();
        let (g2, rx2) = registry.register().unwrap();
        assert_ne!(g1.seq(), g2.seq());

        // Out of order.
        assert!(registry.resolve(g2.seq(), Ok(bind_ok(2))));
        assert!(registry.resolve(g1.seq(), Ok(bind_ok(1))));
        assert_eq!(rx1.await.unwrap().unwrap(), bind_ok(1));
        assert_eq!(rx2.await.unwrap().unwrap(), bind_ok(2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_removed() {
        let registry = Arc::new(PendingRegistry::new());
        let (guard, rx) = registry.register().unwrap();
        let seq = guard.seq();
        drop(rx);
        drop(guard);
        assert!(registry.is_empty());
        assert!(!registry.resolve(seq, Ok(bind_ok(1))));
    }

    #[tokio::test]
    async fn test_drain_resets_everyone() {
        let registry = Arc::new(PendingRegistry::new());
        let mut waiting = Vec::new();
        for _ in 0..5 {
            waiting.push(registry.register().unwrap());
        }
        assert_eq!(registry.drain(), 5);
        for (_guard, rx) in waiting {
            assert_eq!(rx.await.unwrap(), Err(RsktError::ConnectionReset));
        }
        assert!(matches!(registry.register(), Err(RsktError::ConnectionReset)));
        assert_eq!(registry.drain(), 0);
    }

    #[test]
    fn test_wrapping_skips_in_flight() {
        let registry = Arc::new(PendingRegistry::new());
        registry.next_seq.store(u32::MAX, Ordering::Relaxed);
        let (a, _ra) = registry.register().unwrap();
        let (b, _rb) = registry.register().unwrap();
        assert_eq!(a.seq(), u32::MAX);
        assert_eq!(b.seq(), 0);

        // Wrap all the way round onto a sequence number still waiting.
        registry.next_seq.store(u32::MAX, Ordering::Relaxed);
        let (c, _rc) = registry.register().unwrap();
        assert_eq!(c.seq(), 1);
    }
}
