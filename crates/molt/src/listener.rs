//! Connection-tracking TCP listeners.
//!
//! [`TrackedListener`] wraps a [`tokio::net::TcpListener`] with the three
//! things a graceful restart needs:
//!
//! 1. a one-shot stop signal — once raised, every `accept` resolves to the
//!    stopped-sentinel ([`DaemonError::Stopped`]);
//! 2. a live-connection counter — [`wait`](TrackedListener::wait) returns
//!    only when every accepted connection has been dropped;
//! 3. descriptor duplication — [`dup`](TrackedListener::dup) yields an
//!    inheritable copy of the listening socket for the successor process.
//!
//! The counter is incremented *before* the underlying accept is awaited and
//! decremented on every path that does not hand a connection to the caller,
//! so a concurrent `wait` can never observe zero while an acceptance is in
//! flight.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DaemonError;

/// A stream-accepting socket wrapper with live-connection counting and a
/// broadcastable stop signal.
#[derive(Debug)]
pub struct TrackedListener {
    /// Taken (and thereby closed) by `close`. `accept` holds the read guard
    /// only while awaiting; the biased select on the stop token guarantees
    /// the guard is released promptly once the signal is raised.
    inner: RwLock<Option<TcpListener>>,
    /// Advertised local address, cached at construction.
    addr: SocketAddr,
    /// Raw listening descriptor. Valid until `close`.
    fd: RawFd,
    stop: CancellationToken,
    stopped: AtomicBool,
    conns: Arc<Conns>,
}

#[derive(Debug)]
struct Conns {
    count: AtomicUsize,
    drained: Notify,
}

impl TrackedListener {
    /// Wrap an already-bound tokio listener.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        Ok(Self {
            inner: RwLock::new(Some(listener)),
            addr,
            fd,
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            conns: Arc::new(Conns {
                count: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        })
    }

    /// The address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept the next connection.
    ///
    /// Returns [`DaemonError::Stopped`] once the stop signal has been raised,
    /// including when the underlying accept fails because the socket was
    /// closed out from under it. Any other underlying error is returned
    /// verbatim.
    pub async fn accept(&self) -> Result<TrackedStream, DaemonError> {
        // Count the acceptance before awaiting it; the guard undoes the
        // increment on every path that returns no connection.
        let guard = ConnGuard::register(&self.conns);

        let inner = self.inner.read().await;
        let Some(listener) = inner.as_ref() else {
            return Err(DaemonError::Stopped);
        };

        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(DaemonError::Stopped),
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!(local = %self.addr, peer = %peer, "Accepted connection");
                    Ok(TrackedStream {
                        inner: stream,
                        peer,
                        _guard: guard,
                    })
                }
                Err(_) if self.stop.is_cancelled() => Err(DaemonError::Stopped),
                Err(e) => Err(DaemonError::Io(e)),
            },
        }
    }

    /// Raise the stop signal but leave the socket open, so its descriptor
    /// stays valid for inheritance.
    ///
    /// # Panics
    ///
    /// Panics if the listener has already been stopped or closed — that is a
    /// caller bug, not a recoverable state.
    pub fn stop(&self) {
        assert!(
            !self.stopped.swap(true, Ordering::SeqCst),
            "listener {} stopped twice",
            self.addr
        );
        debug!(addr = %self.addr, "Stopping listener");
        self.stop.cancel();
    }

    /// Raise the stop signal and close the underlying socket; the kernel
    /// refuses new connections from this point on.
    ///
    /// # Panics
    ///
    /// Panics if the listener has already been stopped or closed.
    pub async fn close(&self) {
        assert!(
            !self.stopped.swap(true, Ordering::SeqCst),
            "listener {} closed twice",
            self.addr
        );
        debug!(addr = %self.addr, "Closing listener");
        self.stop.cancel();
        self.inner.write().await.take();
    }

    /// Wait until every accepted connection has been dropped. Does not stop
    /// the listener; callers raise the stop signal first.
    pub async fn wait(&self) {
        loop {
            let drained = self.conns.drained.notified();
            tokio::pin!(drained);
            // Register interest before the zero check so a decrement between
            // the check and the await cannot be missed.
            drained.as_mut().enable();
            if self.conns.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Number of connections currently alive.
    pub fn active(&self) -> usize {
        self.conns.count.load(Ordering::SeqCst)
    }

    /// Duplicate the listening descriptor for inheritance by a successor.
    ///
    /// The duplicate has close-on-exec clear; the original stays open and
    /// usable in this process. Only valid before `close`.
    pub fn dup(&self) -> Result<RawFd, DaemonError> {
        let fd = unsafe { libc::dup(self.fd) };
        if fd < 0 {
            return Err(DaemonError::Dup {
                fd: self.fd,
                source: io::Error::last_os_error(),
            });
        }
        Ok(fd)
    }

    /// Dial a throwaway connection to the listener's own port so an accept
    /// call blocked in the kernel observes the raised stop signal. Tries
    /// IPv4 loopback, IPv6 loopback, then the advertised address; the first
    /// success suffices. Total failure is logged, not fatal — the accept may
    /// already be unblocked by other means.
    pub async fn wake(&self) {
        let port = self.addr.port();
        for ip in [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            self.addr.ip(),
        ] {
            match TcpStream::connect((ip, port)).await {
                Ok(_) => {
                    debug!(%ip, port, "Wake dial connected");
                    return;
                }
                Err(e) => debug!(%ip, port, error = %e, "Wake dial failed"),
            }
        }
        warn!(addr = %self.addr, "Failed to wake accept loop with a dial");
    }
}

/// Undoes the speculative increment unless handed to a [`TrackedStream`].
#[derive(Debug)]
struct ConnGuard {
    conns: Arc<Conns>,
}

impl ConnGuard {
    fn register(conns: &Arc<Conns>) -> Self {
        conns.count.fetch_add(1, Ordering::SeqCst);
        Self {
            conns: Arc::clone(conns),
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.conns.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.conns.drained.notify_waiters();
        }
    }
}

/// An accepted connection. Dropping it closes the raw connection and
/// decrements the owning listener's live-connection counter exactly once.
#[derive(Debug)]
pub struct TrackedStream {
    inner: TcpStream,
    peer: SocketAddr,
    _guard: ConnGuard,
}

impl TrackedStream {
    /// The remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
