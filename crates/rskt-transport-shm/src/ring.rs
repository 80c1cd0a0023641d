//! The byte ring between two windows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{Backend, BackendError, PortHandle, RemoteObject, Transfer};
use crate::handshake::{evaluate, HandshakeError, Phase, INITIAL_READ_PTR, INITIAL_WRITE_PTR};
use crate::layout::{
    LayoutError, LinkFlags, RingLayout, RingWindow, LOCAL_QUAD_OFFSET, QUAD_SIZE,
    REMOTE_QUAD_OFFSET,
};
use crate::poll::{poll_until, PollPolicy};

/// Bytes this side may still write: `(remote_read - local_write) mod size`.
///
/// `size` must be a power of two.
#[inline]
pub fn free_bytes(size: u32, local_write: u32, remote_read: u32) -> u32 {
    remote_read.wrapping_sub(local_write) & (size - 1)
}

/// Bytes waiting to be read: `(remote_write - local_read - 1) mod size`.
///
/// `size` must be a power of two.
#[inline]
pub fn used_bytes(size: u32, remote_write: u32, local_read: u32) -> u32 {
    remote_write.wrapping_sub(local_read).wrapping_sub(1) & (size - 1)
}

/// A contiguous run of ring indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub len: u32,
}

/// Split `len` bytes starting at `start` into the tail run up to the end of
/// the ring and, if it wraps, the head run from index 0.
pub fn segments(size: u32, start: u32, len: u32) -> (Segment, Option<Segment>) {
    debug_assert!(start < size && len < size);
    let tail = (size - start).min(len);
    let first = Segment {
        offset: start,
        len: tail,
    };
    let second = (len > tail).then(|| Segment {
        offset: 0,
        len: len - tail,
    });
    (first, second)
}

/// What the rx side holds right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Avail {
    /// Unread bytes (possibly zero).
    Bytes(u32),
    /// The peer is closing and everything it wrote has been read.
    EndOfStream,
    /// The peer raised ERROR.
    Reset,
}

/// Result of a local close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// The peer acknowledged with its own CLOSING flag before the budget ran out.
    pub flushed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("ring is not live")]
    NotLive,

    #[error("no free space before the flow-control budget ran out")]
    FlowControlTimeout,

    #[error("no data before the read budget ran out")]
    ReadTimeout,

    #[error("peer is closing")]
    PeerClosing,

    #[error("peer signalled an error")]
    PeerError,

    #[error("ring is closing")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

impl RingError {
    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RingError::ReadTimeout | RingError::NotLive)
    }
}

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_bytes: u64,
    pub tx_transactions: u64,
    pub rx_bytes: u64,
    pub rx_transactions: u64,
}

#[derive(Debug, Default)]
struct Stats {
    tx_bytes: AtomicU64,
    tx_transactions: AtomicU64,
    rx_bytes: AtomicU64,
    rx_transactions: AtomicU64,
}

/// One side of a connection's data plane.
pub struct Ring {
    backend: Arc<dyn Backend>,
    port: PortHandle,
    transfer: Transfer,
    window: RingWindow,
    remote: RemoteObject,
    /// Serializes header pushes so the last push always carries the newest quad.
    push_lock: Mutex<()>,
    tx_lock: AsyncMutex<()>,
    rx_lock: AsyncMutex<()>,
    live: AtomicBool,
    closing: AtomicBool,
    stats: Stats,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("local", &self.window.mapped().name())
            .field("remote", &self.remote.object)
            .field("transfer", &self.transfer)
            .field("buffer_size", &self.window.layout().buffer_size())
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

impl Ring {
    /// Map the local window, resolve the peer's, and zero the local quad.
    ///
    /// The remote-mirrored quad is left alone: the peer may already have
    /// pushed its first header into it.
    pub fn open(
        backend: Arc<dyn Backend>,
        port: PortHandle,
        transfer: Transfer,
        local_name: &str,
        remote_name: &str,
        buffer_size: u32,
    ) -> Result<Self, RingError> {
        let layout = RingLayout::new(buffer_size)?;
        let size = layout.window_size();
        let mapped = backend.map_window(port, local_name, size)?;

        let remote = match backend.lookup(port, remote_name, size) {
            Ok(remote) => remote,
            Err(e) => {
                let _ = backend.unmap_window(port, &mapped);
                return Err(e.into());
            }
        };
        let window = match RingWindow::new(mapped, layout) {
            Ok(window) => window,
            Err((e, mapped)) => {
                let _ = backend.unmap_window(port, &mapped);
                let _ = backend.release(port, &remote);
                return Err(e.into());
            }
        };
        window.local().zero();

        tracing::debug!(local = local_name, remote = remote_name, buffer_size, ?transfer, "ring: opened");

        Ok(Self {
            backend,
            port,
            transfer,
            window,
            remote,
            push_lock: Mutex::new(()),
            tx_lock: AsyncMutex::new(()),
            rx_lock: AsyncMutex::new(()),
            live: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            stats: Stats::default(),
        })
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.window.layout().buffer_size()
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.stats.tx_bytes.load(Ordering::Relaxed),
            tx_transactions: self.stats.tx_transactions.load(Ordering::Relaxed),
            rx_bytes: self.stats.rx_bytes.load(Ordering::Relaxed),
            rx_transactions: self.stats.rx_transactions.load(Ordering::Relaxed),
        }
    }

    /// Link flags the peer currently shows.
    pub fn remote_link(&self) -> LinkFlags {
        self.window.remote().snapshot().link()
    }

    /// Move `len` bytes at `local_offset` of our window to `remote_offset` of theirs.
    fn transfer(&self, local_offset: usize, remote_offset: usize, len: usize) -> Result<(), BackendError> {
        let local = self.window.mapped().object();
        match self.transfer {
            Transfer::Push => self.backend.push_bytes(
                self.port,
                local,
                local_offset,
                self.remote.object,
                remote_offset,
                len,
            ),
            Transfer::Dma => self.backend.dma_write(
                self.port,
                local,
                local_offset,
                self.remote.dest_id,
                self.remote.addr_of(remote_offset),
                len,
            ),
        }
    }

    fn push_header(&self) -> Result<(), BackendError> {
        let _guard = self.push_lock.lock();
        self.transfer(LOCAL_QUAD_OFFSET, REMOTE_QUAD_OFFSET, QUAD_SIZE)
    }

    /// Run the three-phase handshake.
    ///
    /// `keep_going` is checked on every probe; returning `false` cancels.
    /// On failure the local quad is left showing ERROR so the peer aborts too.
    pub async fn handshake(
        &self,
        policy: &PollPolicy,
        keep_going: impl Fn() -> bool,
    ) -> Result<(), HandshakeError> {
        let result = self.run_handshake(policy, &keep_going).await;
        if let Err(e) = &result {
            tracing::debug!(local = self.window.mapped().name(), error = %e, "ring: handshake failed");
            self.abandon();
        }
        result
    }

    async fn run_handshake(
        &self,
        policy: &PollPolicy,
        keep_going: &impl Fn() -> bool,
    ) -> Result<(), HandshakeError> {
        for phase in Phase::SEQUENCE {
            let local = self.window.local();
            if phase.stamps_pointers() {
                local.set_write_ptr(INITIAL_WRITE_PTR);
                local.set_read_ptr(INITIAL_READ_PTR);
            }
            local.set_handshake(phase.own_flags());
            self.push_header()?;

            poll_until(policy, || {
                if !keep_going() {
                    return Poll::Ready(Err(HandshakeError::Cancelled));
                }
                match evaluate(phase, &self.window.remote().snapshot()) {
                    Ok(true) => Poll::Ready(Ok(())),
                    Ok(false) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                }
            })
            .await
            .map_err(|_| HandshakeError::TimedOut { phase })??;

            tracing::trace!(local = self.window.mapped().name(), ?phase, "ring: phase complete");
        }
        self.live.store(true, Ordering::Release);
        Ok(())
    }

    /// Current rx state.
    pub fn available(&self) -> Avail {
        let remote = self.window.remote().snapshot();
        let link = remote.link();
        if link.contains(LinkFlags::ERROR) {
            return Avail::Reset;
        }
        let layout = self.window.layout();
        let used = used_bytes(
            layout.buffer_size(),
            remote.write_ptr & layout.mask(),
            self.window.local().read_ptr(),
        );
        if used > 0 {
            Avail::Bytes(used)
        } else if link.intersects(LinkFlags::CLOSING | LinkFlags::CLOSED) {
            Avail::EndOfStream
        } else {
            Avail::Bytes(0)
        }
    }

    fn ensure_live(&self) -> Result<(), RingError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(RingError::NotLive)
        }
    }

    /// Write all of `data`, waiting for space as needed.
    ///
    /// Writes that wrap are pushed as two segments before the write pointer
    /// moves. Fails with [`RingError::FlowControlTimeout`] if the peer stops
    /// draining for longer than `policy` allows.
    pub async fn send(
        &self,
        data: &[u8],
        policy: &PollPolicy,
        keep_going: impl Fn() -> bool,
    ) -> Result<usize, RingError> {
        self.ensure_live()?;
        let _tx = self.tx_lock.lock().await;
        let layout = *self.window.layout();
        let size = layout.buffer_size();

        let mut sent = 0usize;
        while sent < data.len() {
            let free = poll_until(policy, || {
                if !keep_going() {
                    return Poll::Ready(Err(RingError::Cancelled));
                }
                if self.is_closing() {
                    return Poll::Ready(Err(RingError::Closed));
                }
                let remote = self.window.remote().snapshot();
                let link = remote.link();
                if link.contains(LinkFlags::ERROR) {
                    return Poll::Ready(Err(RingError::PeerError));
                }
                if link.intersects(LinkFlags::CLOSING | LinkFlags::CLOSED) {
                    return Poll::Ready(Err(RingError::PeerClosing));
                }
                match free_bytes(size, self.window.local().write_ptr(), remote.read_ptr & layout.mask()) {
                    0 => Poll::Pending,
                    n => Poll::Ready(Ok(n)),
                }
            })
            .await
            .map_err(|_| RingError::FlowControlTimeout)??;

            let chunk = &data[sent..];
            let n = (free as usize).min(chunk.len());
            let local = self.window.local();
            let start = local.write_ptr();
            let (first, second) = segments(size, start, n as u32);

            let mut staged = 0usize;
            for seg in std::iter::once(first).chain(second) {
                let bytes = &chunk[staged..staged + seg.len as usize];
                self.window.write_tx(seg.offset, bytes);
                self.transfer(
                    layout.tx_offset() + seg.offset as usize,
                    layout.rx_offset() + seg.offset as usize,
                    bytes.len(),
                )?;
                staged += bytes.len();
                self.stats.tx_transactions.fetch_add(1, Ordering::Relaxed);
            }

            local.set_write_ptr(start.wrapping_add(n as u32) & layout.mask());
            self.push_header()?;
            self.stats.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
            sent += n;
        }
        Ok(sent)
    }

    /// Read up to `out.len()` bytes, waiting for at least one.
    ///
    /// `Ok(0)` is end of stream: the peer is closing and nothing is left.
    /// A peer ERROR is [`RingError::PeerError`], never `Ok(0)`.
    pub async fn recv(
        &self,
        out: &mut [u8],
        policy: &PollPolicy,
        keep_going: impl Fn() -> bool,
    ) -> Result<usize, RingError> {
        self.ensure_live()?;
        if out.is_empty() {
            return Ok(0);
        }
        let _rx = self.rx_lock.lock().await;
        let layout = *self.window.layout();
        let size = layout.buffer_size();

        let avail = poll_until(policy, || match self.available() {
            Avail::Bytes(0) => {
                if !keep_going() {
                    Poll::Ready(Err(RingError::Cancelled))
                } else if self.is_closing() {
                    Poll::Ready(Err(RingError::Closed))
                } else {
                    Poll::Pending
                }
            }
            Avail::Bytes(n) => Poll::Ready(Ok(n)),
            Avail::EndOfStream => Poll::Ready(Ok(0)),
            Avail::Reset => Poll::Ready(Err(RingError::PeerError)),
        })
        .await
        .map_err(|_| RingError::ReadTimeout)??;
        if avail == 0 {
            return Ok(0);
        }

        let n = (avail as usize).min(out.len());
        let local = self.window.local();
        let last = local.read_ptr();
        let start = last.wrapping_add(1) & layout.mask();
        let (first, second) = segments(size, start, n as u32);

        let mut copied = 0usize;
        for seg in std::iter::once(first).chain(second) {
            let len = seg.len as usize;
            self.window.read_rx(seg.offset, &mut out[copied..copied + len]);
            copied += len;
        }

        local.set_read_ptr(last.wrapping_add(n as u32) & layout.mask());
        self.push_header()?;
        self.stats.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.rx_transactions.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    /// Graceful close.
    ///
    /// Raises CLOSING on both local quad sides and pushes the header, then
    /// waits for the peer's CLOSING. A peer that never answers yields
    /// `flushed == false`; the wait is bounded by `policy`. CLOSED is pushed
    /// last, best effort. Calling this again returns immediately.
    pub async fn close(&self, policy: &PollPolicy) -> CloseOutcome {
        if self.closing.swap(true, Ordering::AcqRel) {
            return CloseOutcome { flushed: false };
        }
        let local = self.window.local();
        local.raise(LinkFlags::CLOSING);

        let flushed = match self.push_header() {
            Ok(()) => poll_until(policy, || {
                let link = self.remote_link();
                if link.contains(LinkFlags::ERROR) {
                    Poll::Ready(false)
                } else if link.intersects(LinkFlags::CLOSING | LinkFlags::CLOSED) {
                    Poll::Ready(true)
                } else {
                    Poll::Pending
                }
            })
            .await
            .unwrap_or(false),
            Err(e) => {
                tracing::debug!(local = self.window.mapped().name(), error = %e, "ring: closing push failed");
                false
            }
        };

        local.raise(LinkFlags::CLOSED);
        if let Err(e) = self.push_header() {
            tracing::trace!(local = self.window.mapped().name(), error = %e, "ring: final push failed");
        }
        CloseOutcome { flushed }
    }

    /// Abnormal teardown: show ERROR and CLOSING to the peer.
    pub fn abandon(&self) {
        self.closing.store(true, Ordering::Release);
        self.window.local().raise(LinkFlags::ERROR | LinkFlags::CLOSING);
        if let Err(e) = self.push_header() {
            tracing::trace!(local = self.window.mapped().name(), error = %e, "ring: error push failed");
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // A ring dropped without a close must not look alive to the peer.
        if !self.is_closing() {
            self.abandon();
        }
        if let Err(e) = self.backend.unmap_window(self.port, self.window.mapped()) {
            tracing::warn!(local = self.window.mapped().name(), error = %e, "ring: unmap failed");
        }
        if let Err(e) = self.backend.release(self.port, &self.remote) {
            tracing::warn!(remote = %self.remote.object, error = %e, "ring: remote release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::LoopbackBackend;

    fn quick() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), 200).spin_attempts(8)
    }

    fn open_pair(
        backend: &Arc<LoopbackBackend>,
        transfer: Transfer,
        size: u32,
    ) -> (Ring, Ring) {
        let port = backend.open_port().unwrap();
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let a = Ring::open(dyn_backend.clone(), port, transfer, "t.a", "t.c", size).unwrap();
        let c = Ring::open(dyn_backend, port, transfer, "t.c", "t.a", size).unwrap();
        (a, c)
    }

    async fn connected(backend: &Arc<LoopbackBackend>, transfer: Transfer, size: u32) -> (Ring, Ring) {
        let (a, c) = open_pair(backend, transfer, size);
        let policy = quick();
        let (ra, rc) = tokio::join!(a.handshake(&policy, || true), c.handshake(&policy, || true));
        ra.unwrap();
        rc.unwrap();
        (a, c)
    }

    #[test]
    fn test_accounting_after_handshake() {
        assert_eq!(used_bytes(16, INITIAL_WRITE_PTR, INITIAL_READ_PTR), 0);
        assert_eq!(free_bytes(16, INITIAL_WRITE_PTR, INITIAL_READ_PTR), 15);
        // Full: writer one behind the reader's last-consumed index.
        assert_eq!(free_bytes(16, 0, 0), 0);
        assert_eq!(used_bytes(16, 0, 0), 15);
    }

    #[test]
    fn test_segments_split_at_wrap() {
        assert_eq!(segments(16, 1, 13), (Segment { offset: 1, len: 13 }, None));
        assert_eq!(
            segments(16, 14, 5),
            (
                Segment { offset: 14, len: 2 },
                Some(Segment { offset: 0, len: 3 })
            )
        );
        assert_eq!(segments(16, 15, 1), (Segment { offset: 15, len: 1 }, None));
    }

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        for transfer in [Transfer::Push, Transfer::Dma] {
            let backend = Arc::new(LoopbackBackend::new());
            let (a, c) = connected(&backend, transfer, 64).await;
            let policy = quick();

            assert_eq!(c.send(b"hello", &policy, || true).await.unwrap(), 5);
            let mut buf = [0u8; 32];
            let n = a.recv(&mut buf, &policy, || true).await.unwrap();
            assert_eq!(&buf[..n], b"hello");

            assert_eq!(c.stats().tx_bytes, 5);
            assert_eq!(a.stats().rx_bytes, 5);
            assert_eq!(a.available(), Avail::Bytes(0));
        }
    }

    #[tokio::test]
    async fn test_wrapping_write_is_split() {
        let backend = Arc::new(LoopbackBackend::new().recording());
        let (a, c) = connected(&backend, Transfer::Push, 16).await;
        let policy = quick();

        let first: Vec<u8> = (0..13).collect();
        c.send(&first, &policy, || true).await.unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(a.recv(&mut buf, &policy, || true).await.unwrap(), 13);
        assert_eq!(&buf[..], &first[..]);

        backend.take_transfers();
        c.send(b"VWXYZ", &policy, || true).await.unwrap();
        let data: Vec<_> = backend
            .take_transfers()
            .into_iter()
            .filter(|t| t.len != QUAD_SIZE)
            .map(|t| (t.dst_offset - 64 - 16, t.len))
            .collect();
        assert_eq!(data, vec![(14, 2), (0, 3)]);

        let mut buf = [0u8; 8];
        assert_eq!(a.recv(&mut buf, &policy, || true).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"VWXYZ");
    }

    #[tokio::test]
    async fn test_writer_blocks_until_reader_drains() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, c) = connected(&backend, Transfer::Push, 16).await;
        let policy = PollPolicy::new(Duration::from_millis(1), 2_000);
        let payload: Vec<u8> = (0..100u8).collect();

        let (sent, received) = tokio::join!(c.send(&payload, &policy, || true), async {
            let mut got = Vec::new();
            let mut buf = [0u8; 7];
            while got.len() < 100 {
                let n = a.recv(&mut buf, &policy, || true).await.unwrap();
                got.extend_from_slice(&buf[..n]);
            }
            got
        });
        assert_eq!(sent.unwrap(), 100);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_flow_control_timeout() {
        let backend = Arc::new(LoopbackBackend::new());
        let (_a, c) = connected(&backend, Transfer::Push, 16).await;
        let policy = PollPolicy::new(Duration::from_millis(1), 20).spin_attempts(2);
        let err = c.send(&[0u8; 40], &policy, || true).await.unwrap_err();
        assert_eq!(err, RingError::FlowControlTimeout);
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_fatal() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, _c) = connected(&backend, Transfer::Push, 16).await;
        let policy = PollPolicy::new(Duration::from_millis(1), 10).spin_attempts(2);
        let mut buf = [0u8; 4];
        let err = a.recv(&mut buf, &policy, || true).await.unwrap_err();
        assert_eq!(err, RingError::ReadTimeout);
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_drains_then_end_of_stream() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, c) = connected(&backend, Transfer::Push, 64).await;
        let policy = quick();

        c.send(b"bye", &policy, || true).await.unwrap();
        let (outcome, _) = tokio::join!(c.close(&policy), async {
            // Peer sees the buffered bytes first, then end of stream.
            let mut buf = [0u8; 8];
            let n = a.recv(&mut buf, &policy, || true).await.unwrap();
            assert_eq!(&buf[..n], b"bye");
            assert_eq!(a.recv(&mut buf, &policy, || true).await.unwrap(), 0);
            a.close(&policy).await
        });
        assert!(outcome.flushed);
    }

    #[tokio::test]
    async fn test_close_without_peer_is_not_flushed() {
        let backend = Arc::new(LoopbackBackend::new());
        let (_a, c) = connected(&backend, Transfer::Push, 16).await;
        let policy = PollPolicy::new(Duration::from_millis(1), 10).spin_attempts(2);
        assert!(!c.close(&policy).await.flushed);
        assert!(!c.close(&policy).await.flushed);
    }

    #[tokio::test]
    async fn test_abandon_resets_peer() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, c) = connected(&backend, Transfer::Push, 16).await;
        let policy = quick();
        c.send(b"x", &policy, || true).await.unwrap();
        c.abandon();
        // ERROR wins over buffered data.
        assert_eq!(a.available(), Avail::Reset);
        let mut buf = [0u8; 4];
        assert_eq!(a.recv(&mut buf, &policy, || true).await, Err(RingError::PeerError));
        assert_eq!(a.send(b"y", &policy, || true).await, Err(RingError::PeerError));
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_peer() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, _c) = open_pair(&backend, Transfer::Push, 16);
        let policy = PollPolicy::new(Duration::from_millis(1), 10).spin_attempts(2);
        assert_eq!(
            a.handshake(&policy, || true).await,
            Err(HandshakeError::TimedOut {
                phase: Phase::Announce
            })
        );
        assert!(!a.is_live());
    }

    #[tokio::test]
    async fn test_handshake_cancelled() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, _c) = open_pair(&backend, Transfer::Push, 16);
        assert_eq!(
            a.handshake(&quick(), || false).await,
            Err(HandshakeError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_send_before_handshake_rejected() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, _c) = open_pair(&backend, Transfer::Push, 16);
        assert_eq!(a.send(b"x", &quick(), || true).await, Err(RingError::NotLive));
    }

    #[tokio::test]
    async fn test_drop_unmaps_window() {
        let backend = Arc::new(LoopbackBackend::new());
        let (a, c) = open_pair(&backend, Transfer::Push, 16);
        assert!(backend.contains("t.a"));
        drop(a);
        // Still looked up by the other side.
        assert!(backend.contains("t.a"));
        drop(c);
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_that_never_maps_leaves_nothing_behind() {
        let backend = Arc::new(LoopbackBackend::new());
        let port = backend.open_port().unwrap();
        let c = Ring::open(backend.clone(), port, Transfer::Push, "t.c", "t.a", 16).unwrap();
        assert_eq!(backend.object_count(), 2);
        assert!(matches!(
            c.handshake(&quick(), || true).await,
            Err(HandshakeError::TimedOut { .. })
        ));
        drop(c);
        assert_eq!(backend.object_count(), 0);
    }
}
