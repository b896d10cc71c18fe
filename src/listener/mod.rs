//! Listening sockets feeding a [`DynamicPool`](crate::pool::DynamicPool).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ListenerPool                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐                         │
//! │  │ TcpListener │    │ UdpListener │   (Listener trait)      │
//! │  │   (tcp.rs)  │    │   (udp.rs)  │                         │
//! │  └──────┬──────┘    └──────┬──────┘                         │
//! │         └─────────┬────────┘                                │
//! │           ┌───────▼───────┐  accept loop = pool producer    │
//! │           │  AcceptLoop   │  queue full: wait or terminate  │
//! │           └───────┬───────┘                                 │
//! │                   │ add_task(conn)                          │
//! │           ┌───────▼───────┐                                 │
//! │           │  DynamicPool  │                                 │
//! │           └───────────────┘                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod dispatch;
mod tcp;
mod udp;

pub use dispatch::ListenerPool;
pub use tcp::{TcpConnection, TcpListener};
pub use udp::{Datagram, UdpListener};

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Blocking source of connections.
///
/// `accept` is called in a loop from the pool's producer thread; `close`
/// is called from another thread and must make a blocked `accept` return.
pub trait Listener: Send + Sync + 'static {
    /// The connection type produced by this listener.
    type Conn: Send + 'static;

    /// Wait for the next connection.
    fn accept(&self) -> io::Result<Self::Conn>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Get the listener name for logging.
    fn name(&self) -> &'static str;

    /// Stop accepting and wake a blocked `accept`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Get rid of a connection no worker will serve, so the peer fails
    /// fast instead of hanging.
    fn terminate(&self, conn: Self::Conn);
}

/// Address to reach a socket bound to `addr` from this host.
pub(crate) fn loopback_for(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
