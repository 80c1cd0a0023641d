use std::sync::Arc;
use std::time::Duration;

use rskt::{ConnectorRole, ControlChannel, LoopbackBackend, Rskt, RsktConfig, RsktError, SocketAddr, SocketState};
use rskt_daemon::{Daemon, DaemonConfig};

const CT: u32 = 9;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Node {
    daemon: Daemon,
    backend: Arc<LoopbackBackend>,
}

impl Node {
    fn new() -> Self {
        init_tracing();
        let daemon = Daemon::new(DaemonConfig {
            component_tag: CT,
            buffer_size: 256,
            ..DaemonConfig::default()
        })
        .unwrap();
        Self {
            daemon,
            backend: Arc::new(LoopbackBackend::new()),
        }
    }

    async fn library(&self) -> Arc<Rskt> {
        let (ours, theirs) = ControlChannel::pair().unwrap();
        self.daemon.attach(theirs);
        let config = RsktConfig::default()
            .with_poll_budget(Duration::from_millis(1), Duration::from_secs(2));
        Arc::new(Rskt::start(ours, self.backend.clone(), config).await.unwrap())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bind_address_in_use() {
    let node = Node::new();
    let a = node.library().await;
    let b = node.library().await;
    let first = a.create().unwrap();
    a.bind(first, SocketAddr::new(CT, 42)).await.unwrap();

    let second = b.create().unwrap();
    assert_eq!(b.bind(second, SocketAddr::new(CT, 42)).await, Err(RsktError::AddressInUse));
    assert_eq!(b.state(second).unwrap(), SocketState::Alloced);

    // Closing the first frees the number.
    a.close(first).await.unwrap();
    b.bind(second, SocketAddr::new(CT, 42)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_accept_is_busy() {
    let node = Node::new();
    let a = node.library().await;
    let listener = a.create().unwrap();
    a.bind(listener, SocketAddr::new(0, 50)).await.unwrap();
    a.listen(listener, 4).await.unwrap();

    let waiting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.state(listener).unwrap() != SocketState::Accepting {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(a.accept(listener).await.unwrap_err(), RsktError::Busy);

    // Closing the listener ends the parked accept.
    a.close(listener).await.unwrap();
    let ended = waiting.await.unwrap();
    assert!(ended.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_errors() {
    let node = Node::new();
    let b = node.library().await;
    let sock = b.create().unwrap();
    assert_eq!(
        b.connect(sock, SocketAddr::new(CT + 1, 1)).await,
        Err(RsktError::NoRoute)
    );
    assert_eq!(b.connect(sock, SocketAddr::new(CT, 77)).await, Err(RsktError::Refused));
    // A failed request leaves the socket where it was, and the number
    // bound for the attempt goes back to the daemon.
    assert_eq!(b.state(sock).unwrap(), SocketState::Alloced);
    assert_eq!(b.local_addr(sock).unwrap(), SocketAddr::default());
    assert_eq!(node.daemon.socket_count(), 0);

    let bound = b.create().unwrap();
    b.bind(bound, SocketAddr::new(0, 33)).await.unwrap();
    assert_eq!(b.connect(bound, SocketAddr::new(CT, 77)).await, Err(RsktError::Refused));
    assert_eq!(b.state(bound).unwrap(), SocketState::Bound);
    assert!(node.daemon.is_in_use(33));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_roles_stats_and_bulk_transfer() {
    let node = Node::new();
    let a = node.library().await;
    let b = node.library().await;

    let listener = a.create().unwrap();
    a.bind(listener, SocketAddr::new(0, 60)).await.unwrap();
    a.listen(listener, 1).await.unwrap();
    let accepting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });
    let sock = b.create().unwrap();
    b.connect(sock, SocketAddr::new(CT, 60)).await.unwrap();
    let (accepted, _) = accepting.await.unwrap().unwrap();

    assert_eq!(b.connector_role(sock).unwrap(), Some(ConnectorRole::Initiator));
    assert_eq!(a.connector_role(accepted).unwrap(), Some(ConnectorRole::Acceptor));
    assert_eq!(a.connector_role(listener).unwrap(), None);

    // Several times the ring size, so the writer has to wait on the reader.
    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    let writer = tokio::spawn({
        let b = b.clone();
        let payload = payload.clone();
        async move { b.write(sock, &payload).await }
    });
    let mut got = Vec::new();
    let mut buf = [0u8; 97];
    while got.len() < payload.len() {
        let n = a.read(accepted, &mut buf).await.unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(writer.await.unwrap().unwrap(), payload.len());
    assert_eq!(got, payload);

    let tx = b.stats(sock).unwrap();
    let rx = a.stats(accepted).unwrap();
    assert_eq!(tx.tx_bytes, payload.len() as u64);
    assert_eq!(rx.rx_bytes, payload.len() as u64);
    assert!(tx.tx_transactions > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_abandons_connection() {
    let node = Node::new();
    let a = node.library().await;
    let b = node.library().await;

    let listener = a.create().unwrap();
    a.bind(listener, SocketAddr::new(0, 70)).await.unwrap();
    a.listen(listener, 1).await.unwrap();
    let accepting = tokio::spawn({
        let a = a.clone();
        async move { a.accept(listener).await }
    });
    let sock = b.create().unwrap();
    b.connect(sock, SocketAddr::new(CT, 70)).await.unwrap();
    let (accepted, _) = accepting.await.unwrap().unwrap();

    // The connector's process goes away without closing.
    b.shutdown().await;
    drop(b);

    let mut buf = [0u8; 8];
    let result = tokio::time::timeout(Duration::from_secs(5), a.read(accepted, &mut buf))
        .await
        .unwrap();
    // The daemon may also have forced the survivor closed by now.
    assert!(
        matches!(result, Err(RsktError::ConnectionReset) | Err(RsktError::InvalidHandle(_))),
        "unexpected read result: {result:?}"
    );
}
