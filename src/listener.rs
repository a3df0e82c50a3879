//! Connection-tracking listener.
//!
//! Every accepted connection carries a [`ConnectionGuard`].  The guard
//! decrements the shared in-flight count exactly once, whether closed
//! explicitly, dropped, or both, and wakes drain waiters when the count
//! reaches zero.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use metrics::gauge;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::debug;

use crate::metrics::CONNECTIONS_ACTIVE;

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    drained: Notify,
}

/// Count of in-flight connections with a drain barrier.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. The returned guard releases it.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        ConnectionGuard {
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Connections currently open.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Resolve once no connections are open. Returns immediately at zero.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a close in between is not missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one tracked connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    closed: AtomicBool,
}

impl ConnectionGuard {
    /// Mark the connection closed. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// A TCP listener whose accepted connections are tracked.
#[derive(Debug)]
pub struct TrackingListener {
    listener: TcpListener,
    tracker: ConnectionTracker,
}

impl TrackingListener {
    /// Bind `addr`: `tcp://host:port`, `tcp4://host:port`,
    /// `tcp6://[host]:port`, or `fd://<n>` for an inherited socket.
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = addr
            .split_once("://")
            .with_context(|| format!("listen address missing scheme: {addr}"))?;

        let listener = match scheme {
            "tcp" => TcpListener::bind(rest)
                .await
                .with_context(|| format!("failed to bind {addr}"))?,
            "tcp4" | "tcp6" => {
                let want_v4 = scheme == "tcp4";
                let target = tokio::net::lookup_host(rest)
                    .await
                    .with_context(|| format!("failed to resolve {addr}"))?
                    .find(|a| a.is_ipv4() == want_v4)
                    .with_context(|| format!("no {scheme} address for {addr}"))?;
                TcpListener::bind(target)
                    .await
                    .with_context(|| format!("failed to bind {addr}"))?
            }
            "fd" => {
                let fd: i32 = rest
                    .parse()
                    .with_context(|| format!("invalid file descriptor: {rest}"))?;
                if fd < 3 {
                    bail!("refusing to listen on standard stream descriptor {fd}");
                }
                from_fd(fd)?
            }
            other => bail!("unsupported listen scheme: {other}"),
        };
        Ok(Self::from_listener(listener))
    }

    /// Track connections accepted on an already-bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the in-flight count, valid after the listener is dropped.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept the next connection along with its guard.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr, ConnectionGuard)> {
        let (stream, peer) = self.listener.accept().await?;
        let guard = self.tracker.track();
        debug!(peer = %peer, active = self.tracker.active(), "connection accepted");
        Ok((stream, peer, guard))
    }
}

#[cfg(unix)]
fn from_fd(fd: i32) -> anyhow::Result<TcpListener> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: the supervising process hands over a bound listening socket
    // at this descriptor and nothing else in this process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .local_addr()
        .with_context(|| format!("fd {fd} is not a bound socket"))?;
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener)?)
}

#[cfg(not(unix))]
fn from_fd(_fd: i32) -> anyhow::Result<TcpListener> {
    bail!("fd:// listen addresses are only supported on unix")
}
