//! Accept loop dispatching connections to a dynamic pool.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{ListenerConfig, PoolConfig};
use crate::metrics::MetricsCollector;
use crate::pool::{
    guarded, DynamicPool, PoolError, PoolHandle, PoolResult, PoolStats, Producer, PushError,
    UnitResult, WorkerUnit,
};

use super::{Listener, TcpListener, UdpListener};

/// Pause after an accept error, so a persistent failure (e.g. EMFILE)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct AcceptLoop<L> {
    listener: Arc<L>,
    wait_if_busy: bool,
}

impl<L, U> Producer<U> for AcceptLoop<L>
where
    L: Listener,
    U: WorkerUnit<Task = L::Conn>,
{
    fn produce(&self, pool: &PoolHandle<U>) -> UnitResult {
        // A pool that can never have a consumer serves on this thread. Its
        // unit was initialized by `run()` and is stopped once we return.
        let inline = pool.is_inline();

        info!(
            pool = %pool.name(),
            listener = self.listener.name(),
            addr = ?self.listener.local_addr().ok(),
            inline,
            "accepting connections"
        );

        loop {
            let conn = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if self.listener.is_closed() || pool.is_terminating() {
                        break;
                    }
                    warn!(pool = %pool.name(), error = %e, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                    continue;
                }
            };

            if self.listener.is_closed() || pool.is_terminating() {
                self.listener.terminate(conn);
                break;
            }

            if inline {
                if let Err(e) = guarded(|| pool.unit().run(conn)) {
                    error!(pool = %pool.name(), error = %e, "connection handler failed");
                }
            } else {
                self.dispatch(pool, conn);
            }
        }

        info!(pool = %pool.name(), listener = self.listener.name(), "accept loop stopped");
        Ok(())
    }

    fn stop(&self) {
        self.listener.close();
    }
}

impl<L: Listener> AcceptLoop<L> {
    fn dispatch<U>(&self, pool: &PoolHandle<U>, conn: L::Conn)
    where
        U: WorkerUnit<Task = L::Conn>,
    {
        let conn = match pool.add_task(conn, false) {
            Ok(()) => return,
            Err(PushError::Closed(conn)) => {
                self.listener.terminate(conn);
                return;
            }
            Err(PushError::Full(conn)) => conn,
        };

        let saturation = PoolError::QueueFull {
            capacity: pool.capacity(),
            pending: pool.pending_tasks(),
        };
        warn!(
            pool = %pool.name(),
            pending = pool.pending_tasks(),
            threads = pool.nb_threads(),
            wait = self.wait_if_busy,
            "{}",
            saturation
        );

        if !self.wait_if_busy {
            self.listener.terminate(conn);
            return;
        }
        if let Err(e) = pool.add_task(conn, true) {
            self.listener.terminate(e.into_inner());
        }
    }
}

/// A [`DynamicPool`] fed by the accept loop of a listening socket.
///
/// Each accepted connection becomes one task for the worker unit. When
/// the queue is full the accept loop either blocks until there is room
/// (`wait_if_busy`) or terminates the connection right away.
pub struct ListenerPool<L, U>
where
    L: Listener,
    U: WorkerUnit<Task = L::Conn>,
{
    listener: Arc<L>,
    pool: DynamicPool<U>,
}

impl<L, U> ListenerPool<L, U>
where
    L: Listener,
    U: WorkerUnit<Task = L::Conn>,
{
    pub fn new(listener: L, config: PoolConfig, unit: Arc<U>, wait_if_busy: bool) -> PoolResult<Self> {
        let listener = Arc::new(listener);
        let pool = DynamicPool::new(config, unit)?.with_producer(AcceptLoop {
            listener: Arc::clone(&listener),
            wait_if_busy,
        });
        Ok(Self { listener, pool })
    }

    pub fn with_collector(self, collector: Arc<MetricsCollector>) -> Self {
        Self {
            listener: self.listener,
            pool: self.pool.with_collector(collector),
        }
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> PoolHandle<U> {
        self.pool.handle()
    }

    pub fn set_nb_threads(&self, nb_threads: usize) -> PoolResult<()> {
        self.pool.set_nb_threads(nb_threads)
    }

    pub fn init(&self) -> PoolResult<()> {
        self.pool.init()
    }

    /// Start the workers, then the accept loop.
    pub fn run(&self) -> PoolResult<()> {
        self.pool.run()
    }

    pub fn nb_threads(&self) -> usize {
        self.pool.nb_threads()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the socket, then drain the workers like
    /// [`DynamicPool::shutdown`].
    pub fn shutdown(&self, wait: bool) -> bool {
        self.pool.shutdown(wait)
    }

    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.pool.shutdown_timeout(timeout)
    }
}

impl<U> ListenerPool<TcpListener, U>
where
    U: WorkerUnit<Task = super::TcpConnection>,
{
    /// Bind the TCP socket described by `listener`.
    pub fn tcp(listener: &ListenerConfig, config: PoolConfig, unit: Arc<U>) -> PoolResult<Self> {
        let socket = TcpListener::bind(listener.addr, listener.backlog).map_err(|source| {
            PoolError::Bind {
                addr: listener.addr.to_string(),
                source,
            }
        })?;
        Self::new(socket, config, unit, listener.wait_if_busy)
    }
}

impl<U> ListenerPool<UdpListener, U>
where
    U: WorkerUnit<Task = super::Datagram>,
{
    pub fn udp(addr: SocketAddr, config: PoolConfig, unit: Arc<U>, wait_if_busy: bool) -> PoolResult<Self> {
        let socket = UdpListener::bind(addr).map_err(|source| PoolError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Self::new(socket, config, unit, wait_if_busy)
    }
}
