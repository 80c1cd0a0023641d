//! Per-socket record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rskt_core::SocketAddr;
use rskt_transport_shm::Ring;

/// Which end of a connection this socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorRole {
    /// Called `connect`.
    Initiator,
    /// Came out of `accept`.
    Acceptor,
}

#[derive(Debug, Default)]
struct Info {
    local: SocketAddr,
    peer: Option<SocketAddr>,
    role: Option<ConnectorRole>,
}

/// What the library knows about one socket. State lives in the handle table.
#[derive(Debug, Default)]
pub(crate) struct Socket {
    info: Mutex<Info>,
    ring: Mutex<Option<Arc<Ring>>>,
    /// Set by whoever starts tearing the socket down: `close` or a forced close.
    closing: AtomicBool,
    /// The daemon has been told this socket number is done.
    sn_released: AtomicBool,
}

impl Socket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn accepted(local: SocketAddr, peer: SocketAddr) -> Self {
        let socket = Self::new();
        {
            let mut info = socket.info.lock();
            info.local = local;
            info.peer = Some(peer);
            info.role = Some(ConnectorRole::Acceptor);
        }
        socket
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.info.lock().local
    }

    pub(crate) fn socket_number(&self) -> u32 {
        self.info.lock().local.socket_number
    }

    pub(crate) fn set_local(&self, local: SocketAddr) {
        self.info.lock().local = local;
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.lock().peer
    }

    pub(crate) fn role(&self) -> Option<ConnectorRole> {
        self.info.lock().role
    }

    pub(crate) fn set_connected(&self, local: SocketAddr, peer: SocketAddr, role: ConnectorRole) {
        let mut info = self.info.lock();
        info.local = local;
        info.peer = Some(peer);
        info.role = Some(role);
    }

    pub(crate) fn ring(&self) -> Option<Arc<Ring>> {
        self.ring.lock().clone()
    }

    pub(crate) fn attach_ring(&self, ring: Arc<Ring>) {
        *self.ring.lock() = Some(ring);
    }

    pub(crate) fn detach_ring(&self) -> Option<Arc<Ring>> {
        self.ring.lock().take()
    }

    /// Claim the right to tear the socket down. `true` for the first caller only.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Still owns `sn` as far as the daemon is concerned.
    pub(crate) fn holds_sn(&self, sn: u32) -> bool {
        sn != 0 && self.socket_number() == sn && !self.sn_released.load(Ordering::Acquire)
    }

    /// Claim the right to tell the daemon the socket number is done.
    pub(crate) fn take_sn(&self) -> Option<u32> {
        let info = self.info.lock();
        let sn = info.local.socket_number;
        if sn == 0 || self.sn_released.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(sn)
        }
    }

    /// Forget the local address so the socket can be bound again. Returns
    /// the number to hand back to the daemon, unless someone already did.
    pub(crate) fn unbind(&self) -> Option<u32> {
        let mut info = self.info.lock();
        let sn = std::mem::take(&mut info.local).socket_number;
        (sn != 0 && !self.sn_released.load(Ordering::Acquire)).then_some(sn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_sn_once() {
        let socket = Socket::new();
        assert_eq!(socket.take_sn(), None);
        socket.set_local(SocketAddr::new(5, 4096));
        assert!(socket.holds_sn(4096));
        assert_eq!(socket.take_sn(), Some(4096));
        assert_eq!(socket.take_sn(), None);
        assert!(!socket.holds_sn(4096));
    }

    #[test]
    fn test_unbind_allows_rebinding() {
        let socket = Socket::new();
        socket.set_local(SocketAddr::new(5, 4096));
        assert_eq!(socket.unbind(), Some(4096));
        assert_eq!(socket.local_addr(), SocketAddr::default());
        assert_eq!(socket.take_sn(), None);

        socket.set_local(SocketAddr::new(5, 4097));
        assert_eq!(socket.take_sn(), Some(4097));
        // Released already; nothing left to hand back.
        assert_eq!(socket.unbind(), None);
    }
}
