//! Sessions and connection brokering.
//!
//! Every library connection is a session: a reader task that applies the
//! library's requests to the shared state, and a writer task draining the
//! session's outbox. Requests that wait on another client (ACCEPT and a
//! parked CONNECT) are answered later from whichever session completes the
//! match. The daemon's own requests to a library (forced closes) are
//! correlated through the session's [`PendingRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rskt_core::{
    Body, ChannelError, ConnSetup, ControlChannel, ControlListener, Message, PendingRegistry,
    Reply, Request, Response, Shutdown, SocketAddr, Status,
};
use tokio::sync::mpsc;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::registry::{ClaimError, Deferred, Entry, Listener, QueuedConnect, Registry, Role};

#[derive(Clone)]
struct Session {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<PendingRegistry>,
}

struct State {
    component_tag: u32,
    buffer_size: u32,
    max_backlog: u32,
    sessions: HashMap<u32, Session>,
    registry: Registry,
    next_conn: u64,
}

struct Shared {
    config: DaemonConfig,
    state: Mutex<State>,
    shutdown: Shutdown,
    next_client: AtomicU32,
}

/// The per-node daemon. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Daemon")
            .field("component_tag", &state.component_tag)
            .field("sessions", &state.sessions.len())
            .field("sockets", &state.registry.len())
            .finish()
    }
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let state = State {
            component_tag: config.component_tag,
            buffer_size: config.buffer_size,
            max_backlog: config.max_backlog.max(1),
            sessions: HashMap::new(),
            registry: Registry::new(config.dynamic_range.clone()),
            next_conn: 1,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                shutdown: Shutdown::new(),
                next_client: AtomicU32::new(1),
            }),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.shared.config
    }

    pub fn component_tag(&self) -> u32 {
        self.shared.config.component_tag
    }

    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    /// Socket numbers currently in use.
    pub fn socket_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    pub fn is_in_use(&self, sn: u32) -> bool {
        self.shared.state.lock().registry.get(sn).is_some()
    }

    /// Serve one library over `channel`. Returns the client id.
    pub fn attach(&self, channel: ControlChannel) -> u32 {
        let client = self.shared.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRegistry::new());
        self.shared.state.lock().sessions.insert(
            client,
            Session {
                outbox,
                pending: pending.clone(),
            },
        );

        let channel = Arc::new(channel);
        tokio::spawn(writer_loop(
            channel.clone(),
            outbox_rx,
            self.shared.shutdown.clone(),
            client,
        ));
        tokio::spawn(reader_loop(self.shared.clone(), channel, client, pending));
        tracing::debug!(client, "session attached");
        client
    }

    /// Accept library connections until shutdown.
    pub async fn serve(&self, listener: ControlListener) -> Result<(), DaemonError> {
        tracing::info!(
            path = %listener.path().display(),
            component_tag = self.component_tag(),
            "daemon listening"
        );
        let mut stop = self.shared.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.wait() => return Ok(()),
                accepted = listener.accept() => {
                    let client = self.attach(accepted?);
                    tracing::info!(client, "library connected");
                }
            }
        }
    }

    /// Order the library holding `sn` to close it, then recycle the number.
    ///
    /// The number is recycled even if the library never answers.
    pub async fn force_close(&self, sn: u32) -> Result<(), DaemonError> {
        self.shared.force_close(sn).await
    }

    /// Stop every session. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.trigger("daemon shutdown") {
            let sessions: Vec<Session> = self.shared.state.lock().sessions.values().cloned().collect();
            for session in sessions {
                session.pending.drain();
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_triggered()
    }
}

impl Shared {
    async fn force_close(&self, sn: u32) -> Result<(), DaemonError> {
        if self.shutdown.is_triggered() {
            return Err(DaemonError::ShutDown);
        }
        let (client, session) = {
            let state = self.state.lock();
            let entry = state.registry.get(sn).ok_or(DaemonError::UnknownSocket(sn))?;
            let session = state
                .sessions
                .get(&entry.owner)
                .cloned()
                .ok_or(DaemonError::SessionGone(entry.owner))?;
            (entry.owner, session)
        };
        tracing::info!(client, sn, "forcing close");

        let result = self.request_forced_close(client, sn, &session).await;
        if let Err(e) = &result {
            tracing::warn!(client, sn, error = %e, "forced close not acknowledged, recycling anyway");
        }

        let mut state = self.state.lock();
        if state.registry.get(sn).is_some_and(|e| e.owner == client) {
            if let Some(entry) = state.registry.remove(sn) {
                // The library already tore its ring down; the peer only needs unlinking.
                let mut cascade = Vec::new();
                state.retire(sn, entry, true, &mut cascade);
            }
        }
        result
    }

    async fn request_forced_close(
        &self,
        client: u32,
        sn: u32,
        session: &Session,
    ) -> Result<(), DaemonError> {
        let (guard, rx) = session
            .pending
            .register()
            .map_err(|reason| DaemonError::ForcedCloseFailed { sn, reason })?;
        let record = Message::request(guard.seq(), Request::ForcedClose { sn }).encode()?;
        session
            .outbox
            .send(record)
            .map_err(|_| DaemonError::SessionGone(client))?;

        match tokio::time::timeout(self.config.forced_close_timeout, rx).await {
            // NotFound: the library had already let go of the number.
            Ok(Ok(Ok(response))) if response.status.is_ok() || response.status == Status::NotFound => {
                Ok(())
            }
            Ok(Ok(Ok(response))) => Err(DaemonError::ForcedCloseRejected {
                sn,
                status: response.status,
            }),
            Ok(Ok(Err(reason))) => Err(DaemonError::ForcedCloseFailed { sn, reason }),
            Ok(Err(_)) => Err(DaemonError::SessionGone(client)),
            Err(_) => Err(DaemonError::ForcedCloseTimedOut { sn }),
        }
    }

    fn handle(&self, client: u32, seq: u32, request: Request) -> Vec<u32> {
        let mut state = self.state.lock();
        let mut forced = Vec::new();
        match request {
            Request::Hello { pid } => {
                tracing::debug!(client, pid, "hello");
                let reply = Reply::Hello {
                    component_tag: state.component_tag,
                    client_id: client,
                };
                state.respond(client, seq, Response::ok(request, reply));
            }
            Request::Bind { sn } => state.bind(client, seq, request, sn),
            Request::Listen { sn, backlog } => state.listen(client, seq, request, sn, backlog),
            Request::Accept { sn } => state.accept(client, seq, request, sn),
            Request::Connect { local_sn, peer } => state.connect(client, seq, request, local_sn, peer),
            Request::Close { sn, flushed } => state.close(client, seq, request, sn, flushed, &mut forced),
            Request::ForcedClose { .. } => {
                state.respond(client, seq, Response::error(request, Status::InvalidArgument));
            }
        }
        forced
    }

    /// Forget a library that went away.
    fn depart(&self, client: u32) -> Vec<u32> {
        let mut state = self.state.lock();
        state.sessions.remove(&client);
        let mut forced = Vec::new();
        let sns = state.registry.owned_by(client);
        for &sn in &sns {
            if let Some(entry) = state.registry.remove(sn) {
                state.retire(sn, entry, false, &mut forced);
            }
        }
        tracing::info!(client, recycled = sns.len(), peers = forced.len(), "library departed");
        forced
    }
}

fn spawn_forced_closes(shared: &Arc<Shared>, sns: Vec<u32>) {
    for sn in sns {
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.force_close(sn).await {
                tracing::debug!(sn, error = %e, "forwarded forced close failed");
            }
        });
    }
}

impl State {
    fn respond(&self, client: u32, seq: u32, response: Response) {
        let Some(session) = self.sessions.get(&client) else {
            tracing::debug!(client, seq, "response for a departed client dropped");
            return;
        };
        match Message::response(seq, response).encode() {
            Ok(record) => {
                if session.outbox.send(record).is_err() {
                    tracing::debug!(client, seq, "session outbox closed");
                }
            }
            Err(e) => tracing::error!(client, seq, error = %e, "cannot encode response"),
        }
    }

    fn fail(&self, deferred: Deferred, status: Status) {
        self.respond(deferred.client, deferred.seq, Response::error(deferred.request, status));
    }

    fn bind(&mut self, client: u32, seq: u32, request: Request, sn: u32) {
        let response = match self.registry.claim(sn, client, false) {
            Ok(sn) => {
                tracing::debug!(client, sn, "bound");
                Response::ok(request, Reply::Bind { sn })
            }
            Err(ClaimError::InUse) => Response::error(request, Status::AddressInUse),
            Err(ClaimError::Exhausted) => Response::error(request, Status::Exhausted),
        };
        self.respond(client, seq, response);
    }

    fn listen(&mut self, client: u32, seq: u32, request: Request, sn: u32, backlog: u32) {
        let backlog = backlog.clamp(1, self.max_backlog) as usize;
        let status = match self.registry.owned_mut(sn, client) {
            None => Status::NotBound,
            Some(entry) => match entry.role {
                Role::Bound => {
                    entry.role = Role::Listening(Listener {
                        backlog,
                        ..Listener::default()
                    });
                    Status::Ok
                }
                Role::Listening(_) => Status::Busy,
                _ => Status::InvalidArgument,
            },
        };
        let response = if status.is_ok() {
            tracing::debug!(client, sn, backlog, "listening");
            Response::ok(request, Reply::Listen)
        } else {
            Response::error(request, status)
        };
        self.respond(client, seq, response);
    }

    fn accept(&mut self, client: u32, seq: u32, request: Request, sn: u32) {
        let deferred = Deferred {
            client,
            seq,
            request,
        };
        let Some(entry) = self.registry.owned_mut(sn, client) else {
            return self.fail(deferred, Status::NotBound);
        };
        let Role::Listening(listener) = &mut entry.role else {
            return self.fail(deferred, Status::InvalidArgument);
        };
        if listener.accept.is_some() {
            return self.fail(deferred, Status::Busy);
        }
        match listener.connects.pop_front() {
            Some(connect) => self.establish(sn, deferred, connect),
            None => listener.accept = Some(deferred),
        }
    }

    fn connect(&mut self, client: u32, seq: u32, request: Request, local_sn: u32, peer: SocketAddr) {
        let deferred = Deferred {
            client,
            seq,
            request,
        };
        if peer.component_tag != self.component_tag {
            return self.fail(deferred, Status::NoRoute);
        }
        let target = peer.socket_number;
        if !matches!(self.registry.get(target).map(|e| &e.role), Some(Role::Listening(_))) {
            return self.fail(deferred, Status::Refused);
        }

        let sn = if local_sn == 0 {
            match self.registry.claim(0, client, true) {
                Ok(sn) => sn,
                Err(_) => return self.fail(deferred, Status::Exhausted),
            }
        } else {
            match self.registry.owned_mut(local_sn, client) {
                Some(entry) if entry.role == Role::Bound => local_sn,
                _ => return self.fail(deferred, Status::InvalidArgument),
            }
        };
        if let Some(entry) = self.registry.get_mut(sn) {
            entry.role = Role::Connecting { listener: target };
        }

        let queued = QueuedConnect { deferred, sn };
        let Some(Entry {
            role: Role::Listening(listener),
            ..
        }) = self.registry.get_mut(target)
        else {
            return self.abort_connect(queued, Status::Refused);
        };
        if let Some(accept) = listener.accept.take() {
            self.establish(target, accept, queued);
        } else if listener.connects.len() >= listener.backlog {
            tracing::debug!(listener = target, backlog = listener.backlog, "backlog full");
            self.abort_connect(queued, Status::Refused);
        } else {
            listener.connects.push_back(queued);
        }
    }

    /// Give a parked connector its socket number back and fail its CONNECT.
    fn abort_connect(&mut self, connect: QueuedConnect, status: Status) {
        match self.registry.get_mut(connect.sn) {
            Some(entry) if entry.ephemeral => {
                self.registry.remove(connect.sn);
            }
            Some(entry) => entry.role = Role::Bound,
            None => {}
        }
        self.fail(connect.deferred, status);
    }

    /// Pair an ACCEPT with a CONNECT and answer both.
    fn establish(&mut self, listener: u32, accept: Deferred, connect: QueuedConnect) {
        let acceptor = match self.registry.claim(0, accept.client, true) {
            Ok(sn) => sn,
            Err(_) => {
                self.fail(accept, Status::Exhausted);
                return self.abort_connect(connect, Status::Refused);
            }
        };
        let conn = self.next_conn;
        self.next_conn += 1;

        let ct = self.component_tag;
        let acceptor_window = format!("rskt.{ct}.{conn}.a");
        let connector_window = format!("rskt.{ct}.{conn}.c");

        if let Some(entry) = self.registry.get_mut(acceptor) {
            entry.role = Role::Connected {
                peer: Some(connect.sn),
            };
        }
        if let Some(entry) = self.registry.get_mut(connect.sn) {
            entry.role = Role::Connected {
                peer: Some(acceptor),
            };
        }

        let accept_reply = Reply::Accept {
            new_sn: acceptor,
            peer: SocketAddr::new(ct, connect.sn),
            setup: ConnSetup {
                local_window: acceptor_window.clone(),
                remote_window: connector_window.clone(),
                buffer_size: self.buffer_size,
            },
        };
        let connect_reply = Reply::Connect {
            local_sn: connect.sn,
            peer: SocketAddr::new(ct, listener),
            setup: ConnSetup {
                local_window: connector_window,
                remote_window: acceptor_window,
                buffer_size: self.buffer_size,
            },
        };
        self.respond(accept.client, accept.seq, Response::ok(accept.request, accept_reply));
        let d = connect.deferred;
        self.respond(d.client, d.seq, Response::ok(d.request, connect_reply));
        tracing::info!(conn, listener, acceptor, connector = connect.sn, "connection brokered");
    }

    fn close(
        &mut self,
        client: u32,
        seq: u32,
        request: Request,
        sn: u32,
        flushed: bool,
        forced: &mut Vec<u32>,
    ) {
        if self.registry.owned_mut(sn, client).is_none() {
            return self.respond(client, seq, Response::error(request, Status::NotFound));
        }
        if let Some(entry) = self.registry.remove(sn) {
            self.retire(sn, entry, flushed, forced);
        }
        tracing::debug!(client, sn, flushed, "closed");
        self.respond(client, seq, Response::ok(request, Reply::Close));
    }

    /// Unwind whatever `sn` was doing after its entry was removed.
    ///
    /// A connected peer is unlinked; with `flushed == false` it is also queued
    /// in `forced` for a forced close.
    fn retire(&mut self, sn: u32, entry: Entry, flushed: bool, forced: &mut Vec<u32>) {
        match entry.role {
            Role::Bound => {}
            Role::Listening(listener) => {
                if let Some(accept) = listener.accept {
                    self.fail(accept, Status::Reset);
                }
                for connect in listener.connects {
                    self.abort_connect(connect, Status::Refused);
                }
            }
            Role::Connecting { listener } => {
                if let Some(Entry {
                    role: Role::Listening(l),
                    ..
                }) = self.registry.get_mut(listener)
                {
                    if let Some(pos) = l.connects.iter().position(|c| c.sn == sn) {
                        if let Some(connect) = l.connects.remove(pos) {
                            self.fail(connect.deferred, Status::Reset);
                        }
                    }
                }
            }
            Role::Connected { peer } => {
                let Some(peer) = peer else { return };
                if let Some(Entry {
                    role: Role::Connected { peer: link },
                    ..
                }) = self.registry.get_mut(peer)
                {
                    *link = None;
                    if !flushed {
                        forced.push(peer);
                    }
                }
            }
        }
    }
}

async fn writer_loop(
    channel: Arc<ControlChannel>,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: Shutdown,
    client: u32,
) {
    let mut stop = shutdown.subscribe();
    loop {
        let record = tokio::select! {
            _ = stop.wait() => break,
            record = outbox.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        if let Err(e) = channel.send(&record).await {
            tracing::warn!(client, error = %e, "send to library failed");
            break;
        }
    }
    // Wakes the reader so the session is torn down once.
    channel.shutdown();
    tracing::trace!(client, "writer exiting");
}

async fn reader_loop(
    shared: Arc<Shared>,
    channel: Arc<ControlChannel>,
    client: u32,
    pending: Arc<PendingRegistry>,
) {
    let mut stop = shared.shutdown.subscribe();
    loop {
        let received = tokio::select! {
            _ = stop.wait() => break,
            received = channel.recv() => received,
        };
        let record = match received {
            Ok(record) => record,
            Err(ChannelError::Closed) => break,
            Err(e) => {
                tracing::warn!(client, error = %e, "receive from library failed");
                break;
            }
        };
        match Message::decode(&record) {
            Ok(Message {
                seq,
                body: Body::Request(request),
            }) => {
                tracing::trace!(client, seq, kind = ?request.kind(), "request");
                let forced = shared.handle(client, seq, request);
                spawn_forced_closes(&shared, forced);
            }
            Ok(Message {
                seq,
                body: Body::Response(response),
            }) => {
                if !pending.resolve(seq, Ok(response)) {
                    tracing::debug!(client, seq, "late response dropped");
                }
            }
            Err(e) => {
                tracing::warn!(client, error = %e, "malformed record, dropping library");
                break;
            }
        }
    }

    pending.drain();
    if !shared.shutdown.is_triggered() {
        let forced = shared.depart(client);
        spawn_forced_closes(&shared, forced);
    }
    channel.shutdown();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const CT: u32 = 5;

    struct Client {
        channel: ControlChannel,
        seq: u32,
    }

    impl Client {
        fn attach(daemon: &Daemon) -> Self {
            let (ours, theirs) = ControlChannel::pair().unwrap();
            daemon.attach(theirs);
            Self {
                channel: ours,
                seq: 0,
            }
        }

        async fn send(&mut self, request: Request) -> u32 {
            self.seq += 1;
            let record = Message::request(self.seq, request).encode().unwrap();
            self.channel.send(&record).await.unwrap();
            self.seq
        }

        async fn recv(&self) -> Message {
            let record = tokio::time::timeout(Duration::from_secs(5), self.channel.recv())
                .await
                .expect("daemon went quiet")
                .unwrap();
            Message::decode(&record).unwrap()
        }

        async fn call(&mut self, request: Request) -> Response {
            let seq = self.send(request).await;
            let message = self.recv().await;
            assert_eq!(message.seq, seq);
            match message.body {
                Body::Response(response) => response,
                Body::Request(r) => panic!("unexpected request {r:?}"),
            }
        }

        async fn bind_listen(&mut self, sn: u32) {
            let response = self.call(Request::Bind { sn }).await;
            assert_eq!(response.reply, Some(Reply::Bind { sn }));
            let response = self.call(Request::Listen { sn, backlog: 1 }).await;
            assert!(response.status.is_ok());
        }

        /// Answer the next daemon request, which must be a forced close.
        async fn ack_forced_close(&self) -> u32 {
            let message = self.recv().await;
            let Body::Request(request @ Request::ForcedClose { sn }) = message.body else {
                panic!("expected a forced close, got {:?}", message.body)
            };
            let ack = Message::response(message.seq, Response::ok(request, Reply::ForcedClose));
            self.channel.send(&ack.encode().unwrap()).await.unwrap();
            sn
        }
    }

    fn daemon() -> Daemon {
        Daemon::new(DaemonConfig {
            component_tag: CT,
            forced_close_timeout: Duration::from_millis(500),
            ..DaemonConfig::default()
        })
        .unwrap()
    }

    /// Broker a connection to listener `sn` and return
    /// (acceptor sn, connector sn, acceptor setup, connector setup).
    async fn broker(a: &mut Client, b: &mut Client, sn: u32) -> (u32, u32, ConnSetup, ConnSetup) {
        a.bind_listen(sn).await;
        let accept_seq = a.send(Request::Accept { sn }).await;
        let response = b
            .call(Request::Connect {
                local_sn: 0,
                peer: SocketAddr::new(CT, sn),
            })
            .await;
        let Some(Reply::Connect {
            local_sn,
            peer,
            setup: connector,
        }) = response.reply
        else {
            panic!("connect failed: {response:?}")
        };
        assert_eq!(peer, SocketAddr::new(CT, sn));

        let message = a.recv().await;
        assert_eq!(message.seq, accept_seq);
        let Body::Response(Response {
            reply: Some(Reply::Accept { new_sn, peer, setup }),
            ..
        }) = message.body
        else {
            panic!("accept failed")
        };
        assert_eq!(peer, SocketAddr::new(CT, local_sn));
        (new_sn, local_sn, setup, connector)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn test_hello_assigns_client_ids() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        let ra = a.call(Request::Hello { pid: 1 }).await;
        let rb = b.call(Request::Hello { pid: 2 }).await;
        let (Some(Reply::Hello { component_tag, client_id: ia }), Some(Reply::Hello { client_id: ib, .. })) =
            (ra.reply, rb.reply)
        else {
            panic!("hello failed")
        };
        assert_eq!(component_tag, CT);
        assert_ne!(ia, ib);
        assert_eq!(d.session_count(), 2);
    }

    #[tokio::test]
    async fn test_bind_in_use_and_dynamic() {
        let d = daemon();
        let mut a = Client::attach(&d);
        assert!(a.call(Request::Bind { sn: 100 }).await.status.is_ok());
        assert_eq!(a.call(Request::Bind { sn: 100 }).await.status, Status::AddressInUse);

        let response = a.call(Request::Bind { sn: 0 }).await;
        let Some(Reply::Bind { sn }) = response.reply else { panic!("dynamic bind failed") };
        assert!(d.config().dynamic_range.contains(&sn));
        assert!(d.is_in_use(sn));
    }

    #[tokio::test]
    async fn test_listen_unbound() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let response = a.call(Request::Listen { sn: 9, backlog: 1 }).await;
        assert_eq!(response.status, Status::NotBound);
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let d = daemon();
        let mut b = Client::attach(&d);
        let foreign = b
            .call(Request::Connect {
                local_sn: 0,
                peer: SocketAddr::new(CT + 1, 100),
            })
            .await;
        assert_eq!(foreign.status, Status::NoRoute);
        let nobody = b
            .call(Request::Connect {
                local_sn: 0,
                peer: SocketAddr::new(CT, 100),
            })
            .await;
        assert_eq!(nobody.status, Status::Refused);
        assert_eq!(d.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_windows_are_mirrored() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        let (acceptor, connector, accept_setup, connect_setup) = broker(&mut a, &mut b, 100).await;
        assert_ne!(acceptor, connector);
        assert_eq!(accept_setup.local_window, connect_setup.remote_window);
        assert_eq!(accept_setup.remote_window, connect_setup.local_window);
        assert_eq!(accept_setup.buffer_size, d.config().buffer_size);
        // listener + acceptor + connector
        assert_eq!(d.socket_count(), 3);
    }

    #[tokio::test]
    async fn test_backlog_overflow_refused() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        a.bind_listen(100).await;

        let peer = SocketAddr::new(CT, 100);
        let parked = b.send(Request::Connect { local_sn: 0, peer }).await;
        let second = b.call(Request::Connect { local_sn: 0, peer }).await;
        assert_eq!(second.status, Status::Refused);

        let accepted = a.call(Request::Accept { sn: 100 }).await;
        assert!(matches!(accepted.reply, Some(Reply::Accept { .. })));
        let message = b.recv().await;
        assert_eq!(message.seq, parked);
    }

    #[tokio::test]
    async fn test_closing_parked_connector_withdraws_it() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        a.bind_listen(100).await;
        assert!(b.call(Request::Bind { sn: 200 }).await.status.is_ok());

        let parked = b
            .send(Request::Connect {
                local_sn: 200,
                peer: SocketAddr::new(CT, 100),
            })
            .await;
        let close = b.send(Request::Close { sn: 200, flushed: false }).await;
        let first = b.recv().await;
        assert_eq!(first.seq, parked);
        let Body::Response(response) = first.body else { panic!() };
        assert_eq!(response.status, Status::Reset);
        assert_eq!(b.recv().await.seq, close);
        assert!(!d.is_in_use(200));

        // The backlog is empty again, so an accept has nothing to take.
        a.send(Request::Accept { sn: 100 }).await;
        let quiet = tokio::time::timeout(Duration::from_millis(200), a.channel.recv()).await;
        assert!(quiet.is_err(), "accept answered: {quiet:?}");
    }

    #[tokio::test]
    async fn test_closing_listener_fails_accept() {
        let d = daemon();
        let mut a = Client::attach(&d);
        a.bind_listen(100).await;
        let accept = a.send(Request::Accept { sn: 100 }).await;
        let close = a.send(Request::Close { sn: 100, flushed: true }).await;

        let first = a.recv().await;
        assert_eq!(first.seq, accept);
        let Body::Response(response) = first.body else { panic!() };
        assert_eq!(response.status, Status::Reset);
        let second = a.recv().await;
        assert_eq!(second.seq, close);
        assert!(!d.is_in_use(100));
    }

    #[tokio::test]
    async fn test_unflushed_close_forwards_forced_close() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        let (acceptor, connector, _, _) = broker(&mut a, &mut b, 100).await;

        let response = b.call(Request::Close { sn: connector, flushed: false }).await;
        assert!(response.status.is_ok());
        assert_eq!(a.ack_forced_close().await, acceptor);
        eventually(|| !d.is_in_use(acceptor)).await;
    }

    #[tokio::test]
    async fn test_departure_recycles_and_forces_peers() {
        let d = daemon();
        let mut a = Client::attach(&d);
        let mut b = Client::attach(&d);
        let (acceptor, connector, _, _) = broker(&mut a, &mut b, 100).await;

        drop(b);
        assert_eq!(a.ack_forced_close().await, acceptor);
        eventually(|| !d.is_in_use(connector) && !d.is_in_use(acceptor)).await;
        eventually(|| d.session_count() == 1).await;
        assert!(d.is_in_use(100));
    }

    #[tokio::test]
    async fn test_force_close_waits_for_ack() {
        let d = daemon();
        let mut a = Client::attach(&d);
        assert!(a.call(Request::Bind { sn: 7 }).await.status.is_ok());

        let forcing = tokio::spawn({
            let d = d.clone();
            async move { d.force_close(7).await }
        });
        assert_eq!(a.ack_forced_close().await, 7);
        forcing.await.unwrap().unwrap();
        assert!(!d.is_in_use(7));
    }

    #[tokio::test]
    async fn test_force_close_silent_library() {
        let d = daemon();
        let mut a = Client::attach(&d);
        assert!(a.call(Request::Bind { sn: 7 }).await.status.is_ok());
        let err = d.force_close(7).await.unwrap_err();
        assert!(matches!(err, DaemonError::ForcedCloseTimedOut { sn: 7 }));
        assert!(!d.is_in_use(7));
        assert!(matches!(d.force_close(7).await, Err(DaemonError::UnknownSocket(7))));
    }
}
