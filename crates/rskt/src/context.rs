//! The library context: one control channel, one handle table, three tasks.

use std::path::Path;
use std::sync::Arc;
use std::task::Poll;

use parking_lot::Mutex;
use rskt_core::{
    ConnSetup, ControlChannel, Reply, Request, Resource, Response, RsktError, Shutdown,
    SocketAddr, Status,
};
use rskt_transport_shm::{poll_until, Avail, Backend, PortHandle, Ring, RingError, StatsSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RsktConfig;
use crate::link::{Inbound, Link};
use crate::socket::{ConnectorRole, Socket};
use crate::state::SocketState;
use crate::table::{Handle, HandleTable, TableError};

/// A running rskt library instance.
///
/// Created with [`Rskt::start`]; every socket operation goes through it.
/// Dropping the context triggers shutdown.
pub struct Rskt {
    inner: Arc<Inner>,
}

struct Inner {
    config: RsktConfig,
    table: HandleTable<Socket>,
    link: Link,
    backend: Arc<dyn Backend>,
    port: PortHandle,
    component_tag: u32,
    client_id: u32,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn table_err(e: TableError) -> RsktError {
    match e {
        TableError::Exhausted => RsktError::Exhausted(Resource::Handles),
        TableError::Invalid(h) | TableError::Stale(h) => RsktError::InvalidHandle(h.as_raw()),
        TableError::WrongState { actual, .. } | TableError::Refused(actual) => {
            RsktError::InvalidState(actual.name())
        }
    }
}

fn into_reply(response: Response) -> Result<Option<Reply>, RsktError> {
    response.status.into_result()?;
    Ok(response.reply)
}

fn unexpected(reply: Option<Reply>) -> RsktError {
    tracing::error!(?reply, "daemon answered with the wrong reply");
    RsktError::DaemonUnreachable
}

impl Rskt {
    /// Start the worker tasks on `channel` and introduce ourselves to the daemon.
    pub async fn start(
        channel: ControlChannel,
        backend: Arc<dyn Backend>,
        config: RsktConfig,
    ) -> Result<Self, RsktError> {
        let shutdown = Shutdown::new();
        let (link, inbound, mut tasks) = Link::spawn(
            channel,
            config.queue_depth,
            config.request_timeout,
            shutdown.clone(),
        );

        let abort = |reason: &str, tasks: Vec<JoinHandle<()>>| {
            shutdown.trigger(reason);
            link.drain();
            for task in tasks {
                task.abort();
            }
        };

        let hello = Request::Hello {
            pid: std::process::id(),
        };
        let (component_tag, client_id) = match link.request(hello).await.and_then(into_reply) {
            Ok(Some(Reply::Hello {
                component_tag,
                client_id,
            })) => (component_tag, client_id),
            Ok(other) => {
                abort("hello failed", tasks);
                return Err(unexpected(other));
            }
            Err(e) => {
                tracing::warn!(error = %e, "daemon did not answer hello");
                abort("hello failed", tasks);
                return Err(match e {
                    RsktError::TimedOut | RsktError::ConnectionReset => RsktError::DaemonUnreachable,
                    e => e,
                });
            }
        };

        let port = match backend.open_port() {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(error = %e, "transport port unavailable");
                abort("transport port unavailable", tasks);
                return Err(RsktError::DaemonUnreachable);
            }
        };

        let inner = Arc::new(Inner {
            table: HandleTable::new(config.max_sockets),
            config,
            link,
            backend,
            port,
            component_tag,
            client_id,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        tasks.push(tokio::spawn(handler_loop(inner.clone(), inbound)));
        *inner.tasks.lock() = tasks;

        tracing::info!(component_tag, client_id, "rskt started");
        Ok(Self { inner })
    }

    /// Connect to the daemon listening at `path` and [`start`](Self::start).
    pub async fn connect_daemon(
        path: impl AsRef<Path>,
        backend: Arc<dyn Backend>,
        config: RsktConfig,
    ) -> Result<Self, RsktError> {
        let path = path.as_ref();
        let channel = ControlChannel::connect(path).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "cannot reach daemon");
            RsktError::DaemonUnreachable
        })?;
        Self::start(channel, backend, config).await
    }

    pub fn config(&self) -> &RsktConfig {
        &self.inner.config
    }

    /// Component tag of the node this library runs on.
    pub fn component_tag(&self) -> u32 {
        self.inner.component_tag
    }

    /// Identifier the daemon gave this library instance.
    pub fn client_id(&self) -> u32 {
        self.inner.client_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Requests still waiting on a daemon response.
    pub fn pending_requests(&self) -> usize {
        self.inner.link.pending()
    }

    /// Number of live handles.
    pub fn socket_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Allocate a socket.
    pub fn create(&self) -> Result<Handle, RsktError> {
        if self.is_shut_down() {
            return Err(RsktError::DaemonUnreachable);
        }
        let handle = self.inner.table.acquire(Socket::new()).map_err(table_err)?;
        tracing::trace!(handle = %handle, "socket created");
        Ok(handle)
    }

    /// Bind to `addr`. A zero socket number lets the daemon pick one; a
    /// zero component tag means this node.
    pub async fn bind(&self, handle: Handle, addr: SocketAddr) -> Result<(), RsktError> {
        let inner = &self.inner;
        if addr.component_tag != 0 && addr.component_tag != inner.component_tag {
            return Err(RsktError::InvalidArgument("address belongs to another component"));
        }
        let socket = inner.socket(handle)?;
        inner
            .table
            .transition(handle, SocketState::Alloced, SocketState::ReqBound)
            .map_err(table_err)?;

        let request = Request::Bind {
            sn: addr.socket_number,
        };
        let sn = match inner.link.request(request).await.and_then(into_reply) {
            Ok(Some(Reply::Bind { sn })) => sn,
            Ok(other) => {
                let _ = inner.table.transition(handle, SocketState::ReqBound, SocketState::Alloced);
                return Err(unexpected(other));
            }
            Err(e) => {
                let _ = inner.table.transition(handle, SocketState::ReqBound, SocketState::Alloced);
                return Err(e);
            }
        };

        socket.set_local(SocketAddr::new(inner.component_tag, sn));
        if inner
            .table
            .transition(handle, SocketState::ReqBound, SocketState::Bound)
            .is_err()
        {
            // Closed while the bind was in flight; the close never saw the sn.
            if let Some(sn) = socket.take_sn() {
                inner.notify_close(sn, true).await;
            }
            return Err(RsktError::InvalidHandle(handle.as_raw()));
        }
        tracing::debug!(handle = %handle, sn, "socket bound");
        Ok(())
    }

    /// Start accepting connections on a bound socket.
    pub async fn listen(&self, handle: Handle, backlog: u32) -> Result<(), RsktError> {
        let inner = &self.inner;
        let socket = inner.socket(handle)?;
        match inner
            .table
            .transition(handle, SocketState::Bound, SocketState::ReqListen)
        {
            Ok(()) => {}
            Err(TableError::WrongState {
                actual: SocketState::Alloced,
                ..
            }) => return Err(RsktError::NotBound),
            Err(e) => return Err(table_err(e)),
        }

        let request = Request::Listen {
            sn: socket.socket_number(),
            backlog,
        };
        match inner.link.request(request).await.and_then(into_reply) {
            Ok(Some(Reply::Listen)) => {
                inner
                    .table
                    .transition(handle, SocketState::ReqListen, SocketState::Listening)
                    .map_err(table_err)?;
                tracing::debug!(handle = %handle, sn = socket.socket_number(), backlog, "socket listening");
                Ok(())
            }
            Ok(other) => {
                let _ = inner.table.transition(handle, SocketState::ReqListen, SocketState::Bound);
                Err(unexpected(other))
            }
            Err(RsktError::TimedOut) => {
                // The daemon may be listening already. Closing the number
                // lands after the LISTEN and refuses anything it queued.
                let _ = inner.table.transition(handle, SocketState::ReqListen, SocketState::Closed);
                if let Some(sn) = socket.take_sn() {
                    inner.notify_close(sn, true).await;
                }
                Err(RsktError::TimedOut)
            }
            Err(e) => {
                let _ = inner.table.transition(handle, SocketState::ReqListen, SocketState::Bound);
                Err(e)
            }
        }
    }

    /// Wait for an incoming connection and complete its handshake.
    ///
    /// Waits without a timeout; shutdown or closing the listener ends the wait.
    pub async fn accept(&self, listener: Handle) -> Result<(Handle, SocketAddr), RsktError> {
        let inner = &self.inner;
        let socket = inner.socket(listener)?;
        match inner
            .table
            .transition(listener, SocketState::Listening, SocketState::Accepting)
        {
            Ok(()) => {}
            Err(TableError::WrongState {
                actual: SocketState::Accepting,
                ..
            }) => return Err(RsktError::Busy),
            Err(e) => return Err(table_err(e)),
        }

        let request = Request::Accept {
            sn: socket.socket_number(),
        };
        let result = inner.link.request_with(request, None).await.and_then(into_reply);
        let _ = inner
            .table
            .transition(listener, SocketState::Accepting, SocketState::Listening);
        let (new_sn, peer, setup) = match result? {
            Some(Reply::Accept { new_sn, peer, setup }) => (new_sn, peer, setup),
            other => return Err(unexpected(other)),
        };

        let local = SocketAddr::new(inner.component_tag, new_sn);
        let handle = match inner.table.acquire(Socket::accepted(local, peer)) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(sn = new_sn, %peer, "no handle for accepted connection");
                inner.notify_close(new_sn, false).await;
                return Err(table_err(e));
            }
        };
        let conn = inner.socket(handle)?;
        inner
            .table
            .transition(handle, SocketState::Alloced, SocketState::Connecting)
            .map_err(table_err)?;

        if let Err(e) = inner.establish(handle, &conn, &setup).await {
            inner.fail_connection(handle, &conn).await;
            inner.release(handle, &conn);
            return Err(e);
        }
        tracing::debug!(handle = %handle, sn = new_sn, %peer, "connection accepted");
        Ok((handle, peer))
    }

    /// Connect to a listening socket and complete the handshake.
    ///
    /// An unbound socket is given a dynamic socket number first. If the
    /// daemon does not answer the CONNECT in time the socket is torn down
    /// and its number closed, which withdraws a CONNECT still parked in the
    /// listener's backlog; only `close` remains after that.
    pub async fn connect(&self, handle: Handle, addr: SocketAddr) -> Result<(), RsktError> {
        let inner = &self.inner;
        let socket = inner.socket(handle)?;
        let prev = inner
            .table
            .update(handle, |state| match state {
                SocketState::Alloced | SocketState::Bound => Some(SocketState::ReqConnect),
                _ => None,
            })
            .map_err(table_err)?;

        if prev == SocketState::Alloced {
            match inner.link.request(Request::Bind { sn: 0 }).await.and_then(into_reply) {
                Ok(Some(Reply::Bind { sn })) => {
                    socket.set_local(SocketAddr::new(inner.component_tag, sn));
                }
                other => {
                    let _ = inner.table.transition(handle, SocketState::ReqConnect, prev);
                    return Err(match other {
                        Ok(reply) => unexpected(reply),
                        Err(e) => e,
                    });
                }
            }
        }

        let request = Request::Connect {
            local_sn: socket.socket_number(),
            peer: addr,
        };
        let (local_sn, setup) = match inner.link.request(request).await.and_then(into_reply) {
            Ok(Some(Reply::Connect { local_sn, setup, .. })) => (local_sn, setup),
            Ok(other) => {
                inner.withdraw_connect(handle, &socket).await;
                return Err(unexpected(other));
            }
            Err(RsktError::TimedOut) => {
                tracing::debug!(handle = %handle, peer = %addr, "connect timed out, withdrawing");
                inner.withdraw_connect(handle, &socket).await;
                return Err(RsktError::TimedOut);
            }
            Err(e) => {
                inner.undo_connect(handle, &socket, prev).await;
                return Err(e);
            }
        };

        socket.set_connected(
            SocketAddr::new(inner.component_tag, local_sn),
            addr,
            ConnectorRole::Initiator,
        );
        let established = match inner
            .table
            .transition(handle, SocketState::ReqConnect, SocketState::Connecting)
        {
            Ok(()) => inner.establish(handle, &socket, &setup).await,
            Err(_) => Err(RsktError::ConnectionReset),
        };
        if let Err(e) = established {
            inner.fail_connection(handle, &socket).await;
            return Err(e);
        }
        tracing::debug!(handle = %handle, sn = local_sn, peer = %addr, "connected");
        Ok(())
    }

    /// Write all of `data`.
    ///
    /// Blocks while the peer's ring is full, up to the flow-control budget;
    /// running out of budget resets the connection.
    pub async fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, RsktError> {
        let inner = &self.inner;
        let socket = inner.socket(handle)?;
        match inner.table.state(handle).map_err(table_err)? {
            SocketState::Connected => {}
            state if !state.has_connection() || state == SocketState::Connecting => {
                return Err(RsktError::NotConnected)
            }
            _ => return Err(RsktError::ConnectionReset),
        }
        if data.is_empty() {
            return Ok(0);
        }
        let ring = socket.ring().ok_or(RsktError::NotConnected)?;

        let keep_going = || {
            !inner.shutdown.is_triggered()
                && inner.table.state(handle) == Ok(SocketState::Connected)
        };
        match ring.send(data, &inner.config.flow_control, keep_going).await {
            Ok(n) => Ok(n),
            Err(RingError::PeerClosing) => {
                let _ = inner
                    .table
                    .transition(handle, SocketState::Connected, SocketState::CloseByRemote);
                Err(RsktError::ConnectionReset)
            }
            Err(RingError::Cancelled | RingError::Closed) => Err(RsktError::ConnectionReset),
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "write failed, resetting connection");
                inner.fail_connection(handle, &socket).await;
                Err(RsktError::ConnectionReset)
            }
        }
    }

    /// Read into `buf`, waiting for at least one byte.
    ///
    /// `Ok(0)` means the peer closed and everything it sent has been read.
    pub async fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, RsktError> {
        let inner = &self.inner;
        if buf.is_empty() {
            return Err(RsktError::InvalidArgument("empty read buffer"));
        }
        let socket = inner.socket(handle)?;
        inner.readable(handle)?;
        let ring = socket.ring().ok_or(RsktError::NotConnected)?;

        let keep_going = || {
            !inner.shutdown.is_triggered()
                && inner.table.state(handle).is_ok_and(SocketState::is_readable)
        };
        match ring.recv(buf, &inner.config.read_wait, keep_going).await {
            Ok(0) => {
                let _ = inner
                    .table
                    .transition(handle, SocketState::Connected, SocketState::CloseByRemote);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(RingError::ReadTimeout) => Err(RsktError::TimedOut),
            Err(RingError::Cancelled | RingError::Closed) => Err(RsktError::ConnectionReset),
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "read failed, resetting connection");
                inner.fail_connection(handle, &socket).await;
                Err(RsktError::ConnectionReset)
            }
        }
    }

    /// Bytes ready to read without waiting. `0` after end of stream.
    ///
    /// A peer error resets the connection just as a read would.
    pub async fn available(&self, handle: Handle) -> Result<usize, RsktError> {
        let inner = &self.inner;
        let socket = inner.socket(handle)?;
        inner.readable(handle)?;
        let ring = socket.ring().ok_or(RsktError::NotConnected)?;
        match ring.available() {
            Avail::Bytes(n) => Ok(n as usize),
            Avail::EndOfStream => Ok(0),
            Avail::Reset => {
                tracing::debug!(handle = %handle, "peer raised an error, resetting connection");
                inner.fail_connection(handle, &socket).await;
                Err(RsktError::ConnectionReset)
            }
        }
    }

    /// Close a socket and release its handle.
    ///
    /// A connected socket is drained through the ring close protocol first.
    /// Closing an already-closed (stale) handle succeeds.
    pub async fn close(&self, handle: Handle) -> Result<(), RsktError> {
        let inner = &self.inner;
        let socket = match inner.table.get(handle) {
            Ok(socket) => socket,
            Err(TableError::Stale(_)) => return Ok(()),
            Err(e) => return Err(table_err(e)),
        };
        if !socket.begin_close() {
            return Ok(());
        }

        let prev = match inner.table.update(handle, |state| {
            Some(match state {
                SocketState::Connected => SocketState::CloseByLocal,
                SocketState::Closed => SocketState::Closed,
                _ => SocketState::Closing,
            })
        }) {
            Ok(prev) => prev,
            Err(TableError::Stale(_)) => return Ok(()),
            Err(e) => return Err(table_err(e)),
        };

        let flushed = match socket.ring() {
            Some(ring) if prev != SocketState::Closed => {
                ring.close(&inner.config.close_wait).await.flushed
            }
            _ => true,
        };
        if let Some(sn) = socket.take_sn() {
            inner.notify_close(sn, flushed).await;
        }
        let _ = inner.table.update(handle, |_| Some(SocketState::Closed));
        inner.release(handle, &socket);
        tracing::debug!(handle = %handle, ?prev, flushed, "socket closed");
        Ok(())
    }

    pub fn state(&self, handle: Handle) -> Result<SocketState, RsktError> {
        self.inner.table.state(handle).map_err(table_err)
    }

    pub fn local_addr(&self, handle: Handle) -> Result<SocketAddr, RsktError> {
        Ok(self.inner.socket(handle)?.local_addr())
    }

    pub fn peer_addr(&self, handle: Handle) -> Result<SocketAddr, RsktError> {
        self.inner
            .socket(handle)?
            .peer_addr()
            .ok_or(RsktError::NotConnected)
    }

    /// Which end of the connection this socket is, once it has one.
    pub fn connector_role(&self, handle: Handle) -> Result<Option<ConnectorRole>, RsktError> {
        Ok(self.inner.socket(handle)?.role())
    }

    /// Ring counters. All zero before the socket is connected.
    pub fn stats(&self, handle: Handle) -> Result<StatsSnapshot, RsktError> {
        Ok(self
            .inner
            .socket(handle)?
            .ring()
            .map(|ring| ring.stats())
            .unwrap_or_default())
    }

    /// Live handle currently holding socket number `sn`.
    pub fn find_by_socket_number(&self, sn: u32) -> Option<Handle> {
        self.inner.table.find(|socket| socket.holds_sn(sn))
    }

    /// Stop the worker tasks and fail every pending request.
    ///
    /// Idempotent. Open rings are abandoned so peers see an error.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger("library shutdown");
        self.inner.link.drain();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "worker task failed");
            }
        }
    }
}

impl Drop for Rskt {
    fn drop(&mut self) {
        self.inner.shutdown.trigger("library dropped");
        self.inner.link.drain();
    }
}

impl std::fmt::Debug for Rskt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rskt")
            .field("component_tag", &self.inner.component_tag)
            .field("client_id", &self.inner.client_id)
            .field("sockets", &self.inner.table.len())
            .field("shut_down", &self.inner.shutdown.is_triggered())
            .finish()
    }
}

impl Inner {
    fn socket(&self, handle: Handle) -> Result<Arc<Socket>, RsktError> {
        self.table.get(handle).map_err(table_err)
    }

    fn readable(&self, handle: Handle) -> Result<(), RsktError> {
        match self.table.state(handle).map_err(table_err)? {
            state if state.is_readable() => Ok(()),
            SocketState::Connecting => Err(RsktError::NotConnected),
            state if !state.has_connection() => Err(RsktError::NotConnected),
            _ => Err(RsktError::ConnectionReset),
        }
    }

    /// Map the connection's windows and run the handshake.
    async fn establish(
        &self,
        handle: Handle,
        socket: &Socket,
        setup: &ConnSetup,
    ) -> Result<(), RsktError> {
        let ring = Ring::open(
            self.backend.clone(),
            self.port,
            self.config.transfer,
            &setup.local_window,
            &setup.remote_window,
            setup.buffer_size,
        )
        .map_err(|e| {
            tracing::warn!(handle = %handle, error = %e, "cannot open ring");
            RsktError::ConnectionReset
        })?;
        let ring = Arc::new(ring);
        socket.attach_ring(ring.clone());

        let keep_going = || {
            !self.shutdown.is_triggered()
                && self.table.state(handle) == Ok(SocketState::Connecting)
        };
        ring.handshake(&self.config.handshake, keep_going)
            .await
            .map_err(|e| {
                tracing::warn!(handle = %handle, error = %e, "handshake aborted");
                RsktError::ConnectionReset
            })?;
        self.table
            .transition(handle, SocketState::Connecting, SocketState::Connected)
            .map_err(|_| RsktError::ConnectionReset)
    }

    /// Tear down a broken connection. The handle stays live until `close`.
    async fn fail_connection(&self, handle: Handle, socket: &Socket) {
        if let Some(ring) = socket.ring() {
            ring.abandon();
        }
        let _ = self.table.update(handle, |state| match state {
            SocketState::Connecting | SocketState::Connected | SocketState::CloseByRemote => {
                Some(SocketState::Closed)
            }
            _ => None,
        });
        if let Some(sn) = socket.take_sn() {
            self.notify_close(sn, false).await;
        }
    }

    /// Put a socket back the way it was before a CONNECT the daemon
    /// answered with an error. A number bound only for this attempt is
    /// returned to the daemon.
    async fn undo_connect(&self, handle: Handle, socket: &Socket, prev: SocketState) {
        if prev == SocketState::Alloced {
            if let Some(sn) = socket.unbind() {
                self.notify_close(sn, true).await;
            }
        }
        let _ = self.table.transition(handle, SocketState::ReqConnect, prev);
    }

    /// Give up on a CONNECT whose outcome is unknown. Closing the number
    /// unflushed pulls a parked CONNECT out of the backlog, or forces the
    /// acceptor closed if the daemon paired it in the meantime.
    async fn withdraw_connect(&self, handle: Handle, socket: &Socket) {
        let _ = self
            .table
            .transition(handle, SocketState::ReqConnect, SocketState::Closed);
        if let Some(sn) = socket.take_sn() {
            self.notify_close(sn, false).await;
        }
    }

    /// Drop the ring and give the slot back.
    fn release(&self, handle: Handle, socket: &Socket) {
        if let Some(ring) = socket.detach_ring() {
            if !ring.is_closing() {
                tracing::warn!(handle = %handle, "unsafe cleanup: releasing a ring that never closed");
                ring.abandon();
            }
        }
        if let Err(e) = self.table.release(handle) {
            tracing::debug!(handle = %handle, error = %e, "release skipped");
        }
    }

    async fn notify_close(&self, sn: u32, flushed: bool) {
        if self.shutdown.is_triggered() {
            return;
        }
        let request = Request::Close { sn, flushed };
        if let Err(e) = self.link.request(request).await.and_then(into_reply) {
            tracing::warn!(sn, error = %e, "daemon did not acknowledge close");
        }
    }

    /// Daemon-ordered close. The handle is released before this returns,
    /// so the acknowledgement always follows the release.
    async fn forced_close(&self, sn: u32) -> Result<(), Status> {
        let handle = self.table.find(|socket| socket.holds_sn(sn)).ok_or(Status::NotFound)?;
        let socket = self.table.get(handle).map_err(|_| Status::NotFound)?;
        tracing::info!(handle = %handle, sn, "forced close");

        if !socket.begin_close() {
            // A local close is already running; wait for it to release.
            let released = poll_until(&self.config.forced_close_wait, || {
                if self.table.get(handle).is_err() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
            if released.is_err() {
                tracing::warn!(handle = %handle, sn, "local close still running at forced-close ack");
            }
            return Ok(());
        }

        // The daemon recycles the number itself.
        let _ = socket.take_sn();
        let _ = self.table.update(handle, |_| Some(SocketState::ShuttingDown));
        if let Some(ring) = socket.ring() {
            let outcome = ring.close(&self.config.close_wait).await;
            tracing::debug!(handle = %handle, flushed = outcome.flushed, "forced close drained");
        }
        let _ = self.table.update(handle, |_| Some(SocketState::ShutDown));
        self.release(handle, &socket);
        Ok(())
    }

    /// Abandon every open ring after the daemon is gone.
    fn teardown(&self) {
        let mut abandoned = 0usize;
        for handle in self.table.handles() {
            let Ok(socket) = self.table.get(handle) else { continue };
            if let Some(ring) = socket.ring() {
                if !ring.is_closing() {
                    ring.abandon();
                    abandoned += 1;
                }
            }
        }
        tracing::debug!(abandoned, "open rings abandoned");
    }
}

async fn handler_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    tracing::debug!("request handler started");
    let mut stop = inner.shutdown.subscribe();
    loop {
        let Inbound { seq, request } = tokio::select! {
            _ = stop.wait() => break,
            next = inbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let response = match request {
            Request::ForcedClose { sn } => match inner.forced_close(sn).await {
                Ok(()) => Response::ok(request, Reply::ForcedClose),
                Err(status) => Response::error(request, status),
            },
            other => {
                tracing::warn!(kind = ?other.kind(), "daemon sent a request the library does not serve");
                Response::error(other, Status::InvalidArgument)
            }
        };
        if let Err(e) = inner.link.respond(seq, response).await {
            tracing::debug!(seq, error = %e, "response not delivered");
        }
    }
    inner.teardown();
    tracing::debug!("request handler exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rskt_core::{Body, Message};
    use rskt_transport_shm::LoopbackBackend;

    use super::*;

    const TAG: u32 = 7;

    /// Answers HELLO and BIND, swallows everything else, and hands back
    /// the channel so a test can keep talking.
    async fn scripted_daemon(channel: ControlChannel, answer_binds: bool) -> ControlChannel {
        let record = channel.recv().await.unwrap();
        let hello = Message::decode(&record).unwrap();
        let Body::Request(request) = hello.body else { panic!("expected a request") };
        let reply = Response::ok(
            request,
            Reply::Hello {
                component_tag: TAG,
                client_id: 1,
            },
        );
        channel
            .send(&Message::response(hello.seq, reply).encode().unwrap())
            .await
            .unwrap();
        if !answer_binds {
            return channel;
        }
        let record = channel.recv().await.unwrap();
        let bind = Message::decode(&record).unwrap();
        let Body::Request(Request::Bind { sn }) = bind.body else { panic!("expected bind") };
        let sn = if sn == 0 { 4096 } else { sn };
        let reply = Response::ok(Request::Bind { sn }, Reply::Bind { sn });
        channel
            .send(&Message::response(bind.seq, reply).encode().unwrap())
            .await
            .unwrap();
        channel
    }

    async fn started(answer_binds: bool) -> (Rskt, tokio::task::JoinHandle<ControlChannel>) {
        let (lib, daemon) = ControlChannel::pair().unwrap();
        let daemon = tokio::spawn(scripted_daemon(daemon, answer_binds));
        let config = RsktConfig {
            request_timeout: Duration::from_millis(500),
            ..RsktConfig::default()
        };
        let rskt = Rskt::start(lib, Arc::new(LoopbackBackend::new()), config)
            .await
            .unwrap();
        (rskt, daemon)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_learns_component_tag() {
        let (rskt, _daemon) = started(false).await;
        assert_eq!(rskt.component_tag(), TAG);
        assert_eq!(rskt.client_id(), 1);
        assert!(!rskt.is_shut_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_without_daemon_answer() {
        let (lib, _daemon) = ControlChannel::pair().unwrap();
        let config = RsktConfig {
            request_timeout: Duration::from_millis(50),
            ..RsktConfig::default()
        };
        let err = Rskt::start(lib, Arc::new(LoopbackBackend::new()), config)
            .await
            .unwrap_err();
        assert_eq!(err, RsktError::DaemonUnreachable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_and_local_addr() {
        let (rskt, _daemon) = started(true).await;
        let h = rskt.create().unwrap();
        rskt.bind(h, SocketAddr::new(0, 0)).await.unwrap();
        assert_eq!(rskt.local_addr(h).unwrap(), SocketAddr::new(TAG, 4096));
        assert_eq!(rskt.state(h).unwrap(), SocketState::Bound);
        assert_eq!(rskt.find_by_socket_number(4096), Some(h));
        assert_eq!(rskt.peer_addr(h), Err(RsktError::NotConnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_foreign_component() {
        let (rskt, _daemon) = started(false).await;
        let h = rskt.create().unwrap();
        let err = rskt.bind(h, SocketAddr::new(TAG + 1, 5)).await.unwrap_err();
        assert!(matches!(err, RsktError::InvalidArgument(_)));
        assert_eq!(rskt.state(h).unwrap(), SocketState::Alloced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listen_requires_bind() {
        let (rskt, _daemon) = started(false).await;
        let h = rskt.create().unwrap();
        assert_eq!(rskt.listen(h, 1).await, Err(RsktError::NotBound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_io_before_connect() {
        let (rskt, _daemon) = started(false).await;
        let h = rskt.create().unwrap();
        assert_eq!(rskt.write(h, b"x").await, Err(RsktError::NotConnected));
        let mut buf = [0u8; 4];
        assert_eq!(rskt.read(h, &mut buf).await, Err(RsktError::NotConnected));
        assert!(matches!(
            rskt.read(h, &mut []).await,
            Err(RsktError::InvalidArgument(_))
        ));
        assert_eq!(rskt.available(h).await, Err(RsktError::NotConnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_twice() {
        let (rskt, _daemon) = started(false).await;
        let h = rskt.create().unwrap();
        rskt.close(h).await.unwrap();
        rskt.close(h).await.unwrap();
        assert_eq!(rskt.state(h), Err(RsktError::InvalidHandle(h.as_raw())));
        assert_eq!(rskt.socket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forced_close_unknown_sn() {
        let (rskt, daemon) = started(false).await;
        let channel = daemon.await.unwrap();
        let request = Request::ForcedClose { sn: 999 };
        channel
            .send(&Message::request(1, request).encode().unwrap())
            .await
            .unwrap();
        let record = channel.recv().await.unwrap();
        let message = Message::decode(&record).unwrap();
        assert_eq!(message.seq, 1);
        let Body::Response(response) = message.body else { panic!("expected a response") };
        assert_eq!(response.status, Status::NotFound);
        drop(rskt);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forced_close_releases_handle_before_ack() {
        let (rskt, daemon) = started(true).await;
        let h = rskt.create().unwrap();
        rskt.bind(h, SocketAddr::new(0, 0)).await.unwrap();
        let channel = daemon.await.unwrap();

        let request = Request::ForcedClose { sn: 4096 };
        channel
            .send(&Message::request(9, request).encode().unwrap())
            .await
            .unwrap();
        let record = channel.recv().await.unwrap();
        let Body::Response(response) = Message::decode(&record).unwrap().body else {
            panic!("expected a response")
        };
        assert!(response.status.is_ok());
        assert!(rskt.state(h).is_err());
        assert_eq!(rskt.find_by_socket_number(4096), None);
        // Already released: closing again is a no-op.
        rskt.close(h).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listen_timeout_closes_number() {
        let (rskt, daemon) = started(true).await;
        let h = rskt.create().unwrap();
        rskt.bind(h, SocketAddr::new(0, 0)).await.unwrap();
        let channel = daemon.await.unwrap();

        let script = async {
            let listen = Message::decode(&channel.recv().await.unwrap()).unwrap();
            assert!(matches!(listen.body, Body::Request(Request::Listen { sn: 4096, .. })));
            // LISTEN goes unanswered; the library then gives the number back.
            let close = Message::decode(&channel.recv().await.unwrap()).unwrap();
            let Body::Request(request) = close.body else { panic!("expected a request") };
            assert_eq!(request, Request::Close { sn: 4096, flushed: true });
            let ack = Message::response(close.seq, Response::ok(request, Reply::Close));
            channel.send(&ack.encode().unwrap()).await.unwrap();
        };
        let (result, ()) = tokio::join!(rskt.listen(h, 1), script);
        assert_eq!(result, Err(RsktError::TimedOut));
        assert_eq!(rskt.state(h).unwrap(), SocketState::Closed);
        assert_eq!(rskt.find_by_socket_number(4096), None);
        rskt.close(h).await.unwrap();
        assert_eq!(rskt.socket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_channel_eof_shuts_down() {
        let (rskt, daemon) = started(false).await;
        drop(daemon.await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !rskt.is_shut_down() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let h = rskt.create();
        assert_eq!(h, Err(RsktError::DaemonUnreachable));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_is_idempotent() {
        let (rskt, _daemon) = started(false).await;
        rskt.shutdown().await;
        rskt.shutdown().await;
        assert!(rskt.is_shut_down());
        assert_eq!(rskt.pending_requests(), 0);
    }
}
