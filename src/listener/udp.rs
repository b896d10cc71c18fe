//! UDP listener: every datagram is a connection.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::{loopback_for, Listener};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;

/// One received datagram with the socket to answer on.
#[derive(Debug)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
    socket: Arc<UdpSocket>,
}

impl Datagram {
    /// Send `data` back to the peer.
    pub fn reply(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.peer)
    }
}

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
}

impl UdpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        Ok(Self {
            socket: Arc::new(socket.into()),
            closed: AtomicBool::new(false),
        })
    }
}

impl Listener for UdpListener {
    type Conn = Datagram;

    fn accept(&self) -> io::Result<Datagram> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, peer) = self.socket.recv_from(&mut buf)?;
        buf.truncate(len);
        Ok(Datagram {
            payload: buf,
            peer,
            socket: Arc::clone(&self.socket),
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unblock recv_from with an empty datagram to ourselves.
        if let Ok(addr) = self.socket.local_addr() {
            if let Err(e) = self.socket.send_to(&[], loopback_for(addr)) {
                warn!(%addr, error = %e, "failed to wake receive loop");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn terminate(&self, datagram: Datagram) {
        debug!(
            peer = %datagram.peer,
            bytes = datagram.payload.len(),
            "dropping datagram"
        );
    }
}
