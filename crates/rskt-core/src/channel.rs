//! Message-boundary-preserving control channel between library and daemon.
//!
//! Built on AF_UNIX `SOCK_SEQPACKET` sockets so each `send` is delivered as
//! exactly one record. The fd is wrapped in `AsyncFd` for readiness
//! notification via epoll.
//!
//! # Usage
//!
//! ```ignore
//! // Daemon side
//! let listener = ControlListener::bind("/run/rskt/rsktd.sock")?;
//! let channel = listener.accept().await?;
//!
//! // Library side
//! let channel = ControlChannel::connect("/run/rskt/rsktd.sock")?;
//! channel.send(&record).await?;
//! let reply = channel.recv().await?;
//! ```
//!
//! All constructors must run inside a tokio runtime.

use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::wire::MAX_RECORD;

/// Errors on the control channel. Any of them means the peer is gone.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("control channel closed by peer")]
    Closed,
    #[error("record of {0} bytes exceeds the limit")]
    RecordTooLarge(usize),
    #[error("short send: {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One end of a connected control channel.
pub struct ControlChannel {
    async_fd: AsyncFd<OwnedFd>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

impl ControlChannel {
    /// Create a connected pair of channels (in-process daemon, tests).
    pub fn pair() -> io::Result<(Self, Self)> {
        let mut fds = [0i32; 2];

        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: socketpair succeeded, fds are valid and owned by us
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        Ok((Self::from_owned_fd(a)?, Self::from_owned_fd(b)?))
    }

    /// Connect to a daemon listening at `path`.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let (addr, len) = sockaddr_un(path.as_ref())?;
        let fd = new_seqpacket_socket()?;

        // Connecting a local socket completes immediately; do it while the fd
        // is still blocking and switch afterwards.
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::from_owned_fd(fd)
    }

    /// Wrap an already-connected seqpacket socket.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
        })
    }

    /// Send one record.
    pub async fn send(&self, record: &[u8]) -> Result<(), ChannelError> {
        if record.len() > MAX_RECORD {
            return Err(ChannelError::RecordTooLarge(record.len()));
        }
        // A zero-length record is indistinguishable from EOF on the other end.
        if record.is_empty() {
            return Err(ChannelError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                "empty control record",
            )));
        }

        loop {
            let mut guard = self.async_fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| send_raw(inner.get_ref().as_raw_fd(), record)) {
                Ok(Ok(sent)) if sent == record.len() => return Ok(()),
                Ok(Ok(sent)) => {
                    return Err(ChannelError::ShortSend {
                        sent,
                        len: record.len(),
                    })
                }
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                    return Err(ChannelError::Closed)
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one record. EOF is reported as [`ChannelError::Closed`].
    pub async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; MAX_RECORD + 1];

        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;

            match guard.try_io(|inner| recv_raw(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(0)) => return Err(ChannelError::Closed),
                Ok(Ok(n)) if n > MAX_RECORD => return Err(ChannelError::RecordTooLarge(n)),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => {
                    return Err(ChannelError::Closed)
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Shut down both directions. A blocked `recv` on either end returns
    /// [`ChannelError::Closed`].
    pub fn shutdown(&self) {
        let ret = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOTCONN: the peer is already gone
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                tracing::warn!("control channel shutdown failed: {}", err);
            }
        }
    }

    /// Get the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

/// Listening socket the daemon accepts library connections on.
pub struct ControlListener {
    async_fd: AsyncFd<OwnedFd>,
    path: PathBuf,
}

impl ControlListener {
    /// Bind and listen at `path`. A stale socket file is replaced.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (addr, len) = sockaddr_un(&path)?;

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let fd = new_seqpacket_socket()?;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { libc::listen(fd.as_raw_fd(), 64) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
            path,
        })
    }

    /// Accept the next library connection.
    pub async fn accept(&self) -> io::Result<ControlChannel> {
        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;

            match guard.try_io(|inner| accept_raw(inner.get_ref().as_raw_fd())) {
                Ok(result) => return ControlChannel::from_owned_fd(result?),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn new_seqpacket_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket succeeded, fd is valid
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "control socket path is empty or too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn send_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: fd is valid, buf is valid for buf.len() bytes
    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: fd is valid, buf is valid for buf.len() bytes
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn accept_raw(fd: RawFd) -> io::Result<OwnedFd> {
    let ret = unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: accept4 succeeded, fd is valid
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}

/// Set a file descriptor to non-blocking mode.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_preserves_record_boundaries() {
        let (a, b) = ControlChannel::pair().unwrap();

        a.send(b"one").await.unwrap();
        a.send(b"two!").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap(), b"two!");
    }

    #[tokio::test]
    async fn test_recv_reports_eof() {
        let (a, b) = ControlChannel::pair().unwrap();
        drop(a);

        let result = tokio::time::timeout(Duration::from_millis(500), b.recv())
            .await
            .expect("recv should observe EOF");
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_recv() {
        let (a, b) = ControlChannel::pair().unwrap();
        let b = std::sync::Arc::new(b);

        let waiter = tokio::spawn({
            let b = b.clone();
            async move { b.recv().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("recv should wake")
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
        drop(a);
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let (a, _b) = ControlChannel::pair().unwrap();
        let big = vec![0u8; MAX_RECORD + 1];
        assert!(matches!(
            a.send(&big).await,
            Err(ChannelError::RecordTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_accept_and_connect() {
        let path = std::env::temp_dir().join(format!("rskt-ctl-{}.sock", std::process::id()));
        let listener = ControlListener::bind(&path).unwrap();

        let client = ControlChannel::connect(&path).unwrap();
        let server = tokio::time::timeout(Duration::from_millis(500), listener.accept())
            .await
            .expect("accept timed out")
            .unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"hello");
        server.send(b"world").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"world");

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_sockaddr_rejects_long_path() {
        let long = "x".repeat(200);
        assert!(sockaddr_un(Path::new(&long)).is_err());
        assert!(sockaddr_un(Path::new("")).is_err());
    }
}
