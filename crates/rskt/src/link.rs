//! The library's end of the control channel.
//!
//! Two tasks own the channel: the sender drains the outbound queue, the
//! receiver demultiplexes inbound records. Responses go to the waiter
//! registered under their sequence number; daemon-initiated requests go to
//! the request-handler queue. Either task hitting a channel error trips the
//! shared [`Shutdown`], and the receiver resolves every pending waiter with
//! `ConnectionReset` on its way out.

use std::sync::Arc;
use std::time::Duration;

use rskt_core::{
    Body, ChannelError, ControlChannel, Kind, Message, Outcome, PendingGuard, PendingRegistry,
    Reply, Request, Response, RsktError, Shutdown,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A request the daemon sent us, with the sequence number to answer on.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub seq: u32,
    pub request: Request,
}

/// Handle for issuing requests over the control channel.
#[derive(Clone)]
pub(crate) struct Link {
    outbox: mpsc::Sender<Vec<u8>>,
    pending: Arc<PendingRegistry>,
    shutdown: Shutdown,
    request_timeout: Duration,
}

impl Link {
    /// Spawn the sender and receiver tasks.
    ///
    /// Returns the link, the queue of daemon-initiated requests, and the
    /// task handles.
    pub(crate) fn spawn(
        channel: ControlChannel,
        queue_depth: usize,
        request_timeout: Duration,
        shutdown: Shutdown,
    ) -> (Self, mpsc::Receiver<Inbound>, Vec<JoinHandle<()>>) {
        let channel = Arc::new(channel);
        let pending = Arc::new(PendingRegistry::new());
        let (outbox, outbox_rx) = mpsc::channel(queue_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_depth.max(1));

        let tasks = vec![
            tokio::spawn(sender_loop(channel.clone(), outbox_rx, shutdown.clone())),
            tokio::spawn(receiver_loop(
                channel,
                pending.clone(),
                inbound_tx,
                shutdown.clone(),
            )),
        ];

        let link = Self {
            outbox,
            pending,
            shutdown,
            request_timeout,
        };
        (link, inbound_rx, tasks)
    }

    /// Send a request and wait for its response with the default timeout.
    pub(crate) async fn request(&self, request: Request) -> Result<Response, RsktError> {
        self.request_with(request, Some(self.request_timeout)).await
    }

    /// Send a request and wait for its response.
    ///
    /// With `timeout == None` the wait ends only on a response or shutdown.
    /// A response with an error status is returned as-is; callers map it.
    pub(crate) async fn request_with(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, RsktError> {
        if self.shutdown.is_triggered() {
            return Err(RsktError::DaemonUnreachable);
        }
        let kind = request.kind();
        // Registered before the record is queued.
        let (guard, mut rx) = self.pending.register()?;
        let seq = guard.seq();
        let record = Message::request(seq, request)
            .encode()
            .map_err(|_| RsktError::InvalidArgument("request does not fit in a control record"))?;
        // The sender task only drops the queue on its way out.
        self.outbox
            .send(record)
            .await
            .map_err(|_| RsktError::DaemonUnreachable)?;
        tracing::trace!(seq, ?kind, "request queued");

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!(seq, ?kind, "request timed out");
                    if kind == Kind::Bind {
                        self.reclaim_late_bind(guard, rx);
                    }
                    return Err(RsktError::TimedOut);
                }
            },
            None => rx.await,
        };
        drop(guard);
        // A dropped sender means the registry went away with the subsystem.
        outcome.unwrap_or(Err(RsktError::ConnectionReset))
    }

    /// Keep waiting for a BIND the caller gave up on and close whatever
    /// number the daemon grants, so it is not held for a socket that no
    /// longer wants it. The wait ends at shutdown if no answer comes.
    fn reclaim_late_bind(&self, guard: PendingGuard, rx: oneshot::Receiver<Outcome>) {
        let link = self.clone();
        tokio::spawn(async move {
            let late = rx.await;
            drop(guard);
            let sn = match late {
                Ok(Ok(Response {
                    reply: Some(Reply::Bind { sn }),
                    ..
                })) => sn,
                _ => return,
            };
            tracing::debug!(sn, "releasing socket number granted after its bind timed out");
            let close = Request::Close { sn, flushed: true };
            if let Err(e) = link.request(close).await.and_then(|r| r.status.into_result()) {
                tracing::warn!(sn, error = %e, "late bind not released");
            }
        });
    }

    /// Answer a daemon-initiated request.
    pub(crate) async fn respond(&self, seq: u32, response: Response) -> Result<(), RsktError> {
        let record = Message::response(seq, response)
            .encode()
            .map_err(|_| RsktError::InvalidArgument("response does not fit in a control record"))?;
        self.outbox
            .send(record)
            .await
            .map_err(|_| RsktError::DaemonUnreachable)
    }

    /// Fail every waiter with `ConnectionReset`.
    pub(crate) fn drain(&self) -> usize {
        self.pending.drain()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

async fn sender_loop(
    channel: Arc<ControlChannel>,
    mut outbox: mpsc::Receiver<Vec<u8>>,
    shutdown: Shutdown,
) {
    tracing::debug!("sender loop started");
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
            tracing::error!(error = %e, "control channel send failed");
            shutdown.trigger("control channel send failed");
            break;
        }
    }
    channel.shutdown();
    tracing::debug!("sender loop exiting");
}

async fn receiver_loop(
    channel: Arc<ControlChannel>,
    pending: Arc<PendingRegistry>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: Shutdown,
) {
    tracing::debug!("receiver loop started");
    let mut stop = shutdown.subscribe();
    loop {
        let received = tokio::select! {
            _ = stop.wait() => break,
            received = channel.recv() => received,
        };
        let record = match received {
            Ok(record) => record,
            Err(ChannelError::Closed) => {
                tracing::warn!("daemon closed the control channel");
                shutdown.trigger("control channel closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "control channel receive failed");
                shutdown.trigger("control channel receive failed");
                break;
            }
        };
        match Message::decode(&record) {
            Ok(Message {
                seq,
                body: Body::Response(response),
            }) => {
                if !pending.resolve(seq, Ok(response)) {
                    tracing::debug!(seq, "response for an abandoned request dropped");
                }
            }
            Ok(Message {
                seq,
                body: Body::Request(request),
            }) => {
                let delivered = tokio::select! {
                    _ = stop.wait() => false,
                    sent = inbound.send(Inbound { seq, request }) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "malformed record from daemon");
                shutdown.trigger("malformed record from daemon");
                break;
            }
        }
    }
    let resolved = pending.drain();
    tracing::debug!(resolved, "receiver loop exiting");
}

#[cfg(test)]
mod tests {
    use rskt_core::SocketAddr;

    use super::*;

    fn spawned() -> (Link, ControlChannel, Vec<JoinHandle<()>>) {
        let (ours, theirs) = ControlChannel::pair().unwrap();
        let (link, _inbound, tasks) =
            Link::spawn(ours, 4, Duration::from_millis(50), Shutdown::new());
        (link, theirs, tasks)
    }

    async fn next_request(channel: &ControlChannel) -> (u32, Request) {
        let record = tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .expect("library went quiet")
            .unwrap();
        match Message::decode(&record).unwrap() {
            Message {
                seq,
                body: Body::Request(request),
            } => (seq, request),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_responses_match_out_of_order() {
        let (link, daemon, _tasks) = spawned();
        let first = link.request_with(Request::Bind { sn: 1 }, None);
        let second = link.request_with(Request::Bind { sn: 2 }, None);
        let answer = async {
            let a = next_request(&daemon).await;
            let b = next_request(&daemon).await;
            for (seq, request) in [b, a] {
                let Request::Bind { sn } = request else { panic!("expected bind") };
                let record = Message::response(seq, Response::ok(request, Reply::Bind { sn }))
                    .encode()
                    .unwrap();
                daemon.send(&record).await.unwrap();
            }
        };
        let (first, second, ()) = tokio::join!(first, second, answer);
        assert_eq!(first.unwrap().reply, Some(Reply::Bind { sn: 1 }));
        assert_eq!(second.unwrap().reply, Some(Reply::Bind { sn: 2 }));
        assert_eq!(link.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_granted_after_timeout_is_closed() {
        let (link, daemon, _tasks) = spawned();
        let (result, (seq, request)) =
            tokio::join!(link.request(Request::Bind { sn: 0 }), next_request(&daemon));
        assert_eq!(result, Err(RsktError::TimedOut));
        assert_eq!(request, Request::Bind { sn: 0 });

        let late = Message::response(seq, Response::ok(request, Reply::Bind { sn: 4100 }));
        daemon.send(&late.encode().unwrap()).await.unwrap();

        let (close_seq, close) = next_request(&daemon).await;
        assert_eq!(close, Request::Close { sn: 4100, flushed: true });
        let ack = Message::response(close_seq, Response::ok(close, Reply::Close));
        daemon.send(&ack.encode().unwrap()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_connect_is_not_reclaimed() {
        let (link, daemon, _tasks) = spawned();
        let connect = Request::Connect {
            local_sn: 9,
            peer: SocketAddr::new(5, 100),
        };
        let (result, (seq, request)) = tokio::join!(link.request(connect), next_request(&daemon));
        assert_eq!(result, Err(RsktError::TimedOut));
        // The waiter is gone; a late answer is dropped on the floor.
        assert_eq!(link.pending(), 0);
        let late = Message::response(seq, Response::error(request, rskt_core::Status::Refused));
        daemon.send(&late.encode().unwrap()).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(100), daemon.recv()).await;
        assert!(quiet.is_err(), "library sent {quiet:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_queue_reports_unreachable_daemon() {
        let (link, _daemon, mut tasks) = spawned();
        let sender = tasks.remove(0);
        sender.abort();
        let _ = sender.await;
        assert_eq!(
            link.request(Request::Bind { sn: 1 }).await,
            Err(RsktError::DaemonUnreachable)
        );
    }
}
