//! rskt-testkit: conformance scenarios for rskt.
//!
//! Provides the `BackendFactory` trait, a [`Harness`] wiring one daemon and
//! any number of library contexts onto a shared in-process fabric, and the
//! scenarios every transfer primitive must pass.
//!
//! # Usage
//!
//! ```ignore
//! use rskt_testkit::PushFactory;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn push_round_trip() {
//!     rskt_testkit::run_round_trip::<PushFactory>().await;
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rskt::{Handle, Rskt, RsktConfig, RsktError, SocketAddr, SocketState};
use rskt_core::{Body, ControlChannel, Message, Reply, Request, Response};
use rskt_daemon::{Daemon, DaemonConfig, DaemonError};
use rskt_transport_shm::{Backend, LoopbackBackend, Ring, Transfer, HEADER_SIZE};
use tokio::task::JoinHandle;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Harness construction failed.
    Setup(String),
    /// A library call failed.
    Rskt(RsktError),
    /// A daemon call failed.
    Daemon(DaemonError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rskt(e) => write!(f, "rskt error: {}", e),
            TestError::Daemon(e) => write!(f, "daemon error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RsktError> for TestError {
    fn from(e: RsktError) -> Self {
        TestError::Rskt(e)
    }
}

impl From<DaemonError> for TestError {
    fn from(e: DaemonError) -> Self {
        TestError::Daemon(e)
    }
}

fn check(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

/// Factory for the fabric a harness runs on.
pub trait BackendFactory: Send + Sync + 'static {
    /// Primitive the libraries move bytes with.
    const TRANSFER: Transfer;

    /// A fresh fabric shared by every library in one harness.
    fn backend() -> Arc<LoopbackBackend>;
}

/// Object-addressed pushes.
pub struct PushFactory;

impl BackendFactory for PushFactory {
    const TRANSFER: Transfer = Transfer::Push;

    fn backend() -> Arc<LoopbackBackend> {
        Arc::new(LoopbackBackend::new().recording())
    }
}

/// Bus-address DMA writes.
pub struct DmaFactory;

impl BackendFactory for DmaFactory {
    const TRANSFER: Transfer = Transfer::Dma;

    fn backend() -> Arc<LoopbackBackend> {
        Arc::new(LoopbackBackend::with_dest_id(3).recording())
    }
}

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One daemon and a fabric; libraries are attached on demand.
pub struct Harness {
    pub daemon: Daemon,
    pub backend: Arc<LoopbackBackend>,
    pub config: RsktConfig,
}

impl Harness {
    pub fn new<F: BackendFactory>(daemon: DaemonConfig, config: RsktConfig) -> Result<Self, TestError> {
        init_tracing();
        Ok(Self {
            daemon: Daemon::new(daemon)?,
            backend: F::backend(),
            config: RsktConfig {
                transfer: F::TRANSFER,
                ..config
            },
        })
    }

    /// Daemon at component tag 5 and short poll budgets.
    pub fn with_defaults<F: BackendFactory>() -> Result<Self, TestError> {
        Self::new::<F>(
            DaemonConfig {
                component_tag: 5,
                ..DaemonConfig::default()
            },
            test_config(),
        )
    }

    /// Start a library context attached to this harness's daemon.
    pub async fn library(&self) -> Result<Arc<Rskt>, TestError> {
        let (ours, theirs) =
            ControlChannel::pair().map_err(|e| TestError::Setup(format!("socketpair: {}", e)))?;
        self.daemon.attach(theirs);
        let rskt = Rskt::start(ours, self.backend.clone(), self.config.clone()).await?;
        Ok(Arc::new(rskt))
    }

    /// A listener on `a` at `sn`, a connected socket on `b`, and the
    /// accepted socket on `a`. Returns `(accepted, connected)`.
    pub async fn connect_pair(
        &self,
        a: &Arc<Rskt>,
        b: &Arc<Rskt>,
        sn: u32,
    ) -> Result<(Handle, Handle), TestError> {
        let listener = a.create()?;
        a.bind(listener, SocketAddr::new(0, sn)).await?;
        a.listen(listener, 1).await?;

        let accepting = tokio::spawn({
            let a = a.clone();
            async move { a.accept(listener).await }
        });
        let connected = b.create()?;
        b.connect(connected, SocketAddr::new(a.component_tag(), sn)).await?;
        let (accepted, _) = accepting
            .await
            .map_err(|e| TestError::Setup(format!("accept task panicked: {}", e)))??;
        Ok((accepted, connected))
    }
}

/// Library config with budgets short enough for tests.
pub fn test_config() -> RsktConfig {
    RsktConfig {
        request_timeout: Duration::from_secs(5),
        ..RsktConfig::default().with_poll_budget(Duration::from_millis(1), Duration::from_secs(2))
    }
}

/// A daemon that answers HELLO and ignores everything else.
pub struct SilentDaemon {
    pub requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SilentDaemon {
    pub fn spawn(channel: ControlChannel, component_tag: u32) -> Self {
        let requests = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                while let Ok(record) = channel.recv().await {
                    let Ok(Message {
                        seq,
                        body: Body::Request(request),
                    }) = Message::decode(&record)
                    else {
                        continue;
                    };
                    if let Request::Hello { .. } = request {
                        let reply = Reply::Hello {
                            component_tag,
                            client_id: 1,
                        };
                        let Ok(record) = Message::response(seq, Response::ok(request, reply)).encode() else {
                            continue;
                        };
                        if channel.send(&record).await.is_err() {
                            break;
                        }
                    } else {
                        tracing::debug!(seq, ?request, "silent daemon: swallowing request");
                        requests.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        Self { requests, task }
    }

    /// Hang up: the library sees the control channel close.
    pub fn hang_up(self) {
        self.task.abort();
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) -> Result<(), TestError> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .map_err(|_| TestError::Assertion(format!("timed out waiting for {}", what)))
}

/// Send one request on a bare control channel and wait for its response.
async fn raw_call(channel: &ControlChannel, seq: u32, request: Request) -> Result<Response, TestError> {
    let record = Message::request(seq, request)
        .encode()
        .map_err(|e| TestError::Setup(e.to_string()))?;
    channel
        .send(&record)
        .await
        .map_err(|e| TestError::Setup(e.to_string()))?;
    let reply = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .map_err(|_| TestError::Assertion(format!("no response to request {}", seq)))?
        .map_err(|e| TestError::Setup(e.to_string()))?;
    match Message::decode(&reply).map_err(|e| TestError::Setup(e.to_string()))? {
        Message {
            seq: got,
            body: Body::Response(response),
        } if got == seq => Ok(response),
        other => Err(TestError::Assertion(format!("expected response {}, got {:?}", seq, other))),
    }
}

async fn read_exact(rskt: &Rskt, handle: Handle, len: usize) -> Result<Vec<u8>, TestError> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = rskt.read(handle, &mut out[filled..]).await?;
        check(n > 0, || format!("end of stream after {} of {} bytes", filled, len))?;
        filled += n;
    }
    Ok(out)
}

// ============================================================================
// Scenarios
// ============================================================================

/// Bind `{5, 100}`, listen, connect, accept, move four bytes.
pub async fn run_round_trip<F: BackendFactory>() {
    if let Err(e) = run_round_trip_inner::<F>().await {
        panic!("run_round_trip failed: {}", e);
    }
}

async fn run_round_trip_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::with_defaults::<F>()?;
    let a = harness.library().await?;
    let b = harness.library().await?;

    let listener = a.create()?;
    a.bind(listener, SocketAddr::new(5, 100)).await?;
    a.listen(listener, 1).await?;
    let accepting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });

    let sock = b.create()?;
    b.connect(sock, SocketAddr::new(5, 100)).await?;
    let (accepted, peer) = accepting
        .await
        .map_err(|e| TestError::Setup(format!("accept task panicked: {}", e)))??;

    let b_local = b.local_addr(sock)?;
    check(peer == SocketAddr::new(b.component_tag(), b_local.socket_number), || {
        format!("accepted peer {} but connector is {}", peer, b_local)
    })?;
    check(b.peer_addr(sock)? == SocketAddr::new(5, 100), || "connector peer".into())?;
    check(a.state(accepted)? == SocketState::Connected, || "acceptor not connected".into())?;

    let written = b.write(sock, &[1, 2, 3, 4]).await?;
    check(written == 4, || format!("wrote {} bytes", written))?;
    let got = read_exact(&a, accepted, 4).await?;
    check(got == [1, 2, 3, 4], || format!("read {:?}", got))?;
    let avail = a.available(accepted).await?;
    check(avail == 0, || format!("{} bytes still available", avail))?;

    let closing = tokio::spawn({
        let b = b.clone();
        async move { b.close(sock).await }
    });
    a.close(accepted).await?;
    closing
        .await
        .map_err(|e| TestError::Setup(format!("close task panicked: {}", e)))??;
    a.close(listener).await?;
    Ok(())
}

/// With a 16-byte ring and the write pointer at 14, a 5-byte write goes
/// out as a 2-byte tail and a 3-byte head and reads back in order.
pub async fn run_wrap_around<F: BackendFactory>() {
    if let Err(e) = run_wrap_around_inner::<F>().await {
        panic!("run_wrap_around failed: {}", e);
    }
}

async fn run_wrap_around_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::new::<F>(
        DaemonConfig {
            component_tag: 5,
            buffer_size: 16,
            ..DaemonConfig::default()
        },
        test_config(),
    )?;
    let a = harness.library().await?;
    let b = harness.library().await?;
    let (accepted, sock) = harness.connect_pair(&a, &b, 200).await?;

    // Write pointer starts at 1; 13 bytes bring it to 14.
    let filler: Vec<u8> = (0..13).collect();
    b.write(sock, &filler).await?;
    check(read_exact(&a, accepted, 13).await? == filler, || "filler corrupted".into())?;

    harness.backend.take_transfers();
    let payload = [0xa0, 0xa1, 0xa2, 0xa3, 0xa4];
    b.write(sock, &payload).await?;
    let got = read_exact(&a, accepted, payload.len()).await?;
    check(got == payload, || format!("wrapped read {:?}", got))?;

    let tx = HEADER_SIZE;
    let rx = HEADER_SIZE + 16;
    let data: Vec<(usize, usize, usize)> = harness
        .backend
        .transfers()
        .into_iter()
        .filter(|t| t.src_offset >= tx && t.mode == F::TRANSFER)
        .map(|t| (t.src_offset, t.dst_offset, t.len))
        .collect();
    check(data == [(tx + 14, rx + 14, 2), (tx, rx, 3)], || {
        format!("data segments {:?}", data)
    })?;
    Ok(())
}

/// A forced close lands while a write is blocked on flow control: the
/// write fails with a reset and the handle is gone before the daemon hears back.
pub async fn run_forced_close_mid_write<F: BackendFactory>() {
    if let Err(e) = run_forced_close_mid_write_inner::<F>().await {
        panic!("run_forced_close_mid_write failed: {}", e);
    }
}

async fn run_forced_close_mid_write_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::new::<F>(
        DaemonConfig {
            component_tag: 5,
            buffer_size: 64,
            ..DaemonConfig::default()
        },
        RsktConfig {
            close_wait: rskt::PollPolicy::with_budget(Duration::from_millis(1), Duration::from_millis(100)),
            ..test_config()
        },
    )?;
    let a = harness.library().await?;
    let b = harness.library().await?;
    let (_accepted, sock) = harness.connect_pair(&a, &b, 300).await?;
    let sn = b.local_addr(sock)?.socket_number;

    // Nobody reads: the write stalls once the ring is full.
    let writing = tokio::spawn({
        let b = b.clone();
        async move { b.write(sock, &[0x55; 4096]).await }
    });
    eventually("the ring to fill", || {
        b.stats(sock).map(|s| s.tx_bytes >= 63).unwrap_or(false)
    })
    .await?;

    harness.daemon.force_close(sn).await?;
    check(b.state(sock).is_err(), || "handle survived the forced close".into())?;

    let result = writing
        .await
        .map_err(|e| TestError::Setup(format!("write task panicked: {}", e)))?;
    check(result == Err(RsktError::ConnectionReset), || {
        format!("blocked write ended with {:?}", result)
    })?;
    check(!harness.daemon.is_in_use(sn), || "socket number not recycled".into())?;
    // Already released; closing is a no-op.
    b.close(sock).await?;
    Ok(())
}

/// N requests wait on a daemon that never answers; shutdown fails all of
/// them with a reset.
pub async fn run_shutdown_drains_pending<F: BackendFactory>() {
    if let Err(e) = run_shutdown_drains_pending_inner::<F>().await {
        panic!("run_shutdown_drains_pending failed: {}", e);
    }
}

async fn run_shutdown_drains_pending_inner<F: BackendFactory>() -> Result<(), TestError> {
    const N: usize = 8;
    init_tracing();
    let (ours, theirs) =
        ControlChannel::pair().map_err(|e| TestError::Setup(format!("socketpair: {}", e)))?;
    let silent = SilentDaemon::spawn(theirs, 5);
    let config = RsktConfig {
        request_timeout: Duration::from_secs(60),
        transfer: F::TRANSFER,
        ..test_config()
    };
    let rskt = Arc::new(Rskt::start(ours, F::backend(), config).await?);

    let mut binds = Vec::with_capacity(N);
    for i in 0..N {
        let handle = rskt.create()?;
        let rskt = rskt.clone();
        binds.push(tokio::spawn(async move {
            rskt.bind(handle, SocketAddr::new(0, 1000 + i as u32)).await
        }));
    }
    eventually("all requests to reach the daemon", || {
        rskt.pending_requests() == N && silent.requests.load(Ordering::SeqCst) == N
    })
    .await?;

    rskt.shutdown().await;
    let results = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(binds))
        .await
        .map_err(|_| TestError::Assertion("pending requests not drained".into()))?;
    for result in results {
        let result = result.map_err(|e| TestError::Setup(format!("bind task panicked: {}", e)))?;
        check(result == Err(RsktError::ConnectionReset), || {
            format!("pending bind ended with {:?}", result)
        })?;
    }
    check(rskt.pending_requests() == 0, || "registry not empty".into())?;
    silent.hang_up();
    Ok(())
}

/// Closing twice is a no-op the second time, on both ends of a connection.
pub async fn run_close_idempotent<F: BackendFactory>() {
    if let Err(e) = run_close_idempotent_inner::<F>().await {
        panic!("run_close_idempotent failed: {}", e);
    }
}

async fn run_close_idempotent_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::with_defaults::<F>()?;
    let a = harness.library().await?;
    let b = harness.library().await?;

    let idle = a.create()?;
    a.close(idle).await?;
    a.close(idle).await?;

    let (accepted, sock) = harness.connect_pair(&a, &b, 400).await?;
    let closing = tokio::spawn({
        let b = b.clone();
        async move { b.close(sock).await }
    });
    a.close(accepted).await?;
    closing
        .await
        .map_err(|e| TestError::Setup(format!("close task panicked: {}", e)))??;
    a.close(accepted).await?;
    b.close(sock).await?;
    check(b.state(sock).is_err() && a.state(accepted).is_err(), || {
        "closed handles still live".into()
    })?;
    Ok(())
}

/// The peer closes first: the reader drains, sees end of stream, and the
/// closer reports a clean flush.
pub async fn run_graceful_close<F: BackendFactory>() {
    if let Err(e) = run_graceful_close_inner::<F>().await {
        panic!("run_graceful_close failed: {}", e);
    }
}

async fn run_graceful_close_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::with_defaults::<F>()?;
    let a = harness.library().await?;
    let b = harness.library().await?;
    let (accepted, sock) = harness.connect_pair(&a, &b, 500).await?;

    b.write(sock, b"last words").await?;
    let closing = tokio::spawn({
        let b = b.clone();
        async move { b.close(sock).await }
    });

    check(read_exact(&a, accepted, 10).await? == b"last words", || "tail lost".into())?;
    let mut buf = [0u8; 8];
    let n = a.read(accepted, &mut buf).await?;
    check(n == 0, || format!("read {} bytes after close", n))?;
    check(a.state(accepted)? == SocketState::CloseByRemote, || "not close_by_remote".into())?;
    let write = a.write(accepted, b"too late").await;
    check(write == Err(RsktError::ConnectionReset), || format!("late write {:?}", write))?;

    a.close(accepted).await?;
    closing
        .await
        .map_err(|e| TestError::Setup(format!("close task panicked: {}", e)))??;
    Ok(())
}

/// The acceptor never runs its half of the handshake; the connector gives
/// up within its budget instead of hanging.
pub async fn run_handshake_timeout<F: BackendFactory>() {
    if let Err(e) = run_handshake_timeout_inner::<F>().await {
        panic!("run_handshake_timeout failed: {}", e);
    }
}

async fn run_handshake_timeout_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::new::<F>(
        DaemonConfig {
            component_tag: 5,
            ..DaemonConfig::default()
        },
        RsktConfig {
            handshake: rskt::PollPolicy::with_budget(Duration::from_millis(1), Duration::from_millis(100)),
            ..test_config()
        },
    )?;

    // A bare control-channel client plays the acceptor and stops after ACCEPT.
    let (raw, theirs) =
        ControlChannel::pair().map_err(|e| TestError::Setup(format!("socketpair: {}", e)))?;
    harness.daemon.attach(theirs);
    let requests = [
        Request::Bind { sn: 600 },
        Request::Listen { sn: 600, backlog: 1 },
        Request::Accept { sn: 600 },
    ];
    for (seq, request) in requests.into_iter().enumerate() {
        let answered = !matches!(request, Request::Accept { .. });
        let record = Message::request(seq as u32 + 1, request)
            .encode()
            .map_err(|e| TestError::Setup(e.to_string()))?;
        raw.send(&record)
            .await
            .map_err(|e| TestError::Setup(e.to_string()))?;
        if answered {
            let reply = raw.recv().await.map_err(|e| TestError::Setup(e.to_string()))?;
            let message = Message::decode(&reply).map_err(|e| TestError::Setup(e.to_string()))?;
            check(
                matches!(message.body, Body::Response(ref r) if r.status.is_ok()),
                || format!("raw acceptor setup failed: {:?}", message),
            )?;
        }
    }

    let b = harness.library().await?;
    let sock = b.create()?;
    let started = tokio::time::Instant::now();
    let result = b.connect(sock, SocketAddr::new(5, 600)).await;
    check(result == Err(RsktError::ConnectionReset), || format!("connect ended with {:?}", result))?;
    check(started.elapsed() < Duration::from_secs(3), || "handshake did not time out".into())?;
    check(b.state(sock)? == SocketState::Closed, || "socket not closed".into())?;
    b.close(sock).await?;
    drop(raw);
    Ok(())
}

/// The daemon goes away: the library shuts itself down and refuses work.
pub async fn run_daemon_loss<F: BackendFactory>() {
    if let Err(e) = run_daemon_loss_inner::<F>().await {
        panic!("run_daemon_loss failed: {}", e);
    }
}

async fn run_daemon_loss_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::with_defaults::<F>()?;
    let a = harness.library().await?;
    let sock = a.create()?;

    harness.daemon.shutdown();
    eventually("the library to shut down", || a.is_shut_down()).await?;

    let bind = a.bind(sock, SocketAddr::new(0, 700)).await;
    check(bind == Err(RsktError::DaemonUnreachable), || format!("bind after loss {:?}", bind))?;
    check(a.create() == Err(RsktError::DaemonUnreachable), || "create after loss".into())?;
    check(a.pending_requests() == 0, || "requests left pending".into())?;
    a.close(sock).await?;
    Ok(())
}

/// A CONNECT still parked in the backlog when its request times out is
/// withdrawn: the listener's next accept waits for a live connector
/// instead of inheriting the abandoned one.
pub async fn run_connect_timeout_withdraws<F: BackendFactory>() {
    if let Err(e) = run_connect_timeout_withdraws_inner::<F>().await {
        panic!("run_connect_timeout_withdraws failed: {}", e);
    }
}

async fn run_connect_timeout_withdraws_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::new::<F>(
        DaemonConfig {
            component_tag: 5,
            ..DaemonConfig::default()
        },
        RsktConfig {
            request_timeout: Duration::from_millis(200),
            ..test_config()
        },
    )?;
    let a = harness.library().await?;
    let b = harness.library().await?;

    let listener = a.create()?;
    a.bind(listener, SocketAddr::new(0, 800)).await?;
    a.listen(listener, 1).await?;

    // Nobody is accepting, so the daemon holds the CONNECT past the timeout.
    let stale = b.create()?;
    let result = b.connect(stale, SocketAddr::new(5, 800)).await;
    check(result == Err(RsktError::TimedOut), || format!("parked connect ended with {:?}", result))?;
    check(b.state(stale)? == SocketState::Closed, || "timed-out socket not closed".into())?;
    eventually("the withdrawn connector to be recycled", || {
        harness.daemon.socket_count() == 1
    })
    .await?;
    b.close(stale).await?;

    let accepting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    check(!accepting.is_finished(), || "accept picked up the withdrawn connect".into())?;

    let live = b.create()?;
    b.connect(live, SocketAddr::new(5, 800)).await?;
    let (accepted, peer) = accepting
        .await
        .map_err(|e| TestError::Setup(format!("accept task panicked: {}", e)))??;
    let live_addr = b.local_addr(live)?;
    check(peer == live_addr, || format!("accepted {} but connector is {}", peer, live_addr))?;

    b.write(live, b"fresh").await?;
    check(read_exact(&a, accepted, 5).await? == b"fresh", || "payload lost".into())?;
    Ok(())
}

/// The peer raises ERROR on its ring without the daemon knowing yet:
/// `available` reports the reset and tears the connection down locally.
pub async fn run_peer_error_seen_by_available<F: BackendFactory>() {
    if let Err(e) = run_peer_error_seen_by_available_inner::<F>().await {
        panic!("run_peer_error_seen_by_available failed: {}", e);
    }
}

async fn run_peer_error_seen_by_available_inner<F: BackendFactory>() -> Result<(), TestError> {
    let harness = Harness::with_defaults::<F>()?;
    let a = harness.library().await?;

    let listener = a.create()?;
    a.bind(listener, SocketAddr::new(0, 900)).await?;
    a.listen(listener, 1).await?;
    let accepting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });

    // A bare control-channel client plays the connector and drives its
    // ring by hand.
    let (raw, theirs) =
        ControlChannel::pair().map_err(|e| TestError::Setup(format!("socketpair: {}", e)))?;
    harness.daemon.attach(theirs);
    let request = Request::Connect {
        local_sn: 0,
        peer: SocketAddr::new(5, 900),
    };
    let response = raw_call(&raw, 1, request).await?;
    let Some(Reply::Connect { setup, .. }) = response.reply else {
        return Err(TestError::Assertion(format!("raw connect failed: {:?}", response)));
    };

    let backend: Arc<dyn Backend> = harness.backend.clone();
    let port = backend
        .open_port()
        .map_err(|e| TestError::Setup(e.to_string()))?;
    let ring = Ring::open(
        backend,
        port,
        F::TRANSFER,
        &setup.local_window,
        &setup.remote_window,
        setup.buffer_size,
    )
    .map_err(|e| TestError::Setup(e.to_string()))?;
    ring.handshake(&harness.config.handshake, || true)
        .await
        .map_err(|e| TestError::Setup(format!("raw handshake: {}", e)))?;
    let (accepted, _) = accepting
        .await
        .map_err(|e| TestError::Setup(format!("accept task panicked: {}", e)))??;
    let sn = a.local_addr(accepted)?.socket_number;

    ring.abandon();
    let avail = a.available(accepted).await;
    check(avail == Err(RsktError::ConnectionReset), || format!("available gave {:?}", avail))?;
    check(a.state(accepted)? == SocketState::Closed, || "connection left open".into())?;
    check(a.find_by_socket_number(sn).is_none(), || "socket number still held".into())?;
    let mut buf = [0u8; 4];
    let read = a.read(accepted, &mut buf).await;
    check(read == Err(RsktError::ConnectionReset), || format!("read after reset {:?}", read))?;

    a.close(accepted).await?;
    a.close(listener).await?;
    drop(ring);
    drop(raw);
    Ok(())
}
