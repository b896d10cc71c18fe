//! Line-oriented TCP service run by the daemon.
//!
//! One command per line, one reply line per command:
//!
//! | Command     | Reply                     |
//! |-------------|---------------------------|
//! | `PING`      | `PONG`                    |
//! | `ECHO text` | `text`                    |
//! | `TIME`      | RFC 3339 UTC timestamp    |
//! | `VERSION`   | crate version             |
//! | `QUIT`      | `BYE`, then disconnect    |
//!
//! Anything else gets `ERR unknown command`.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::listener::TcpConnection;
use crate::metrics::{Event, MetricsCollector};
use crate::pool::{UnitResult, WorkerUnit};

/// Time a client may stay silent before it is disconnected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LineService {
    idle_timeout: Duration,
    collector: Option<Arc<MetricsCollector>>,
}

impl Default for LineService {
    fn default() -> Self {
        Self::new()
    }
}

impl LineService {
    pub fn new() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            collector: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Record one [`Event`] per served command, named after the command.
    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Reply to one command line, and whether the session goes on.
    fn reply(&self, line: &str) -> (String, bool) {
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg),
            None => (line, ""),
        };
        match command.to_ascii_uppercase().as_str() {
            "PING" => ("PONG".to_string(), true),
            "ECHO" => (arg.to_string(), true),
            "TIME" => (Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true), true),
            "VERSION" => (crate::VERSION.to_string(), true),
            "QUIT" => ("BYE".to_string(), false),
            _ => ("ERR unknown command".to_string(), true),
        }
    }
}

impl WorkerUnit for LineService {
    type Task = TcpConnection;

    fn run(&self, conn: TcpConnection) -> UnitResult {
        let peer = conn.remote_addr();
        let stream = conn.into_inner();
        stream.set_read_timeout(Some(self.idle_timeout))?;

        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    debug!(%peer, "idle client disconnected");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if let Some(collector) = &self.collector {
                collector.record(Event::new(command).with_attr("peer", peer.ip().to_string()));
            }

            let (reply, keep_going) = self.reply(command);
            writer.write_all(reply.as_bytes())?;
            writer.write_all(b"\n")?;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}
