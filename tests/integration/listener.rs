//! Connection dispatch through listener pools.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use taskpool::config::{ListenerConfig, PoolConfig};
use taskpool::listener::{ListenerPool, TcpConnection};
use taskpool::pool::{PoolError, UnitResult, WorkerUnit};
use taskpool::service::LineService;

use crate::helpers::*;

fn loopback() -> ListenerConfig {
    ListenerConfig::new("127.0.0.1:0".parse().unwrap())
}

fn connect(pool_addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(pool_addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Closed by the server: EOF or a reset, never a timeout.
fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "unexpected data from a rejected connection"),
        Err(e) => assert!(
            !matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "connection left hanging: {}",
            e
        ),
    }
}

/// A saturated pool that does not wait terminates new connections.
#[test]
fn test_saturated_pool_rejects_connection() {
    let gate = Gate::new();
    let unit = GatedUnit::<TcpConnection>::new(Arc::clone(&gate));
    let pool = ListenerPool::tcp(
        &loopback().with_wait_if_busy(false),
        PoolConfig::new("reject").with_threads(1, 1).with_max_tasks(1),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();
    let addr = pool.local_addr().unwrap();

    // First connection occupies the only worker, second fills the queue.
    let _busy = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || unit.started() == 1));
    let _queued = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || pool.stats().pending_tasks == 1));

    let mut rejected = connect(addr);
    assert_closed_by_server(&mut rejected);
    assert_eq!(unit.started(), 1);

    gate.open();
    assert!(pool.shutdown_timeout(Duration::from_secs(5)));
    assert_eq!(unit.done(), 2);
}

/// A saturated pool that waits keeps the connection until a worker is free.
#[test]
fn test_saturated_pool_waits_when_configured() {
    let gate = Gate::new();
    let unit = GatedUnit::<TcpConnection>::new(Arc::clone(&gate));
    let pool = ListenerPool::tcp(
        &loopback().with_wait_if_busy(true),
        PoolConfig::new("patient").with_threads(1, 1).with_max_tasks(1),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();
    let addr = pool.local_addr().unwrap();

    let _busy = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || unit.started() == 1));
    let _queued = connect(addr);
    assert!(wait_until(Duration::from_secs(5), || pool.stats().pending_tasks == 1));
    let _waiting = connect(addr);

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || unit.done() == 3));
    assert!(pool.shutdown_timeout(Duration::from_secs(5)));
}

#[test]
fn test_line_service_session() {
    let pool = ListenerPool::tcp(
        &loopback(),
        PoolConfig::new("lines").with_threads(2, 4),
        Arc::new(LineService::new()),
    )
    .unwrap();
    pool.run().unwrap();

    let mut stream = connect(pool.local_addr().unwrap());
    stream
        .write_all(b"PING\nECHO tape 42\nFROB\nQUIT\n")
        .unwrap();

    let replies: Vec<String> = BufReader::new(stream)
        .lines()
        .map(|line| line.unwrap())
        .collect();
    assert_eq!(replies, ["PONG", "tape 42", "ERR unknown command", "BYE"]);

    assert!(pool.shutdown_timeout(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_closes_listening_socket() {
    let pool = ListenerPool::tcp(
        &loopback(),
        PoolConfig::new("closing").with_threads(1, 2),
        Arc::new(LineService::new()),
    )
    .unwrap();
    pool.run().unwrap();
    let addr = pool.local_addr().unwrap();

    assert!(pool.shutdown_timeout(Duration::from_secs(5)));
    assert_eq!(pool.nb_threads(), 0);

    // Nothing accepts anymore: refused, or accepted by the kernel and dropped.
    if let Ok(mut late) = TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        late.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let _ = late.write_all(b"PING\n");
        let mut buf = String::new();
        let _ = late.read_to_string(&mut buf);
        assert!(!buf.contains("PONG"));
    }
}

/// Unit that cannot start, e.g. its spool directory is missing.
struct Unprepared;

impl WorkerUnit for Unprepared {
    type Task = TcpConnection;

    fn init(&self) -> UnitResult {
        Err("spool directory missing".into())
    }

    fn run(&self, _conn: TcpConnection) -> UnitResult {
        Ok(())
    }
}

/// Without worker threads the unit is initialized by run(), which fails
/// and closes the socket instead of leaving clients in the backlog.
#[test]
fn test_inline_init_failure_aborts_startup() {
    let pool = ListenerPool::tcp(
        &loopback(),
        PoolConfig::new("unprepared").with_threads(0, 0),
        Arc::new(Unprepared),
    )
    .unwrap();
    let addr = pool.local_addr().unwrap();

    let err = pool.run().unwrap_err();
    assert!(err.is_startup_failure());
    assert!(matches!(err, PoolError::Init { .. }));
    assert!(err.to_string().contains("spool directory missing"));
    assert_eq!(pool.nb_threads(), 0);

    if let Ok(mut late) = TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        late.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_closed_by_server(&mut late);
    }
    assert!(pool.shutdown_timeout(Duration::from_secs(5)));
}
