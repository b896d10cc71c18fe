//! TCP listener implementation.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, warn};

use super::{loopback_for, Listener};

/// A TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl TcpConnection {
    /// Create a new TCP connection.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            remote_addr,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the underlying TCP stream.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

/// A blocking TCP listener.
pub struct TcpListener {
    inner: StdTcpListener,
    closed: AtomicBool,
}

impl TcpListener {
    /// Bind `addr` with `SO_REUSEADDR` and the given accept backlog.
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        Ok(Self {
            inner: socket.into(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn accept(&self) -> io::Result<TcpConnection> {
        let (stream, addr) = self.inner.accept()?;

        // Set TCP_NODELAY for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(peer = %addr, error = %e, "Failed to set TCP keepalive");
        }

        Ok(TcpConnection::new(stream, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Linux wakes a blocked accept() on shutdown; elsewhere, connect to
        // ourselves so accept returns and the closed flag is seen.
        if SockRef::from(&self.inner).shutdown(Shutdown::Both).is_ok() {
            return;
        }
        if let Ok(addr) = self.inner.local_addr() {
            match TcpStream::connect_timeout(&loopback_for(addr), Duration::from_secs(1)) {
                Ok(_) => debug!(%addr, "accept loop woken up"),
                Err(e) => warn!(%addr, error = %e, "failed to wake accept loop"),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn terminate(&self, conn: TcpConnection) {
        debug!(peer = %conn.remote_addr, "terminating connection");
        if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
            debug!(peer = %conn.remote_addr, error = %e, "connection already gone");
        }
    }
}
