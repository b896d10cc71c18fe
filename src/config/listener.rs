//! Listener configuration.

use std::net::SocketAddr;

use super::parse::{env_bool, env_opt, env_or, env_parse};
use super::ConfigError;

/// Default listen address of the daemon.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:15011";

/// Default accept backlog.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Listener configuration loaded from environment.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Listen address (default: 0.0.0.0:15011).
    pub addr: SocketAddr,
    /// Block the accept loop when the pool is saturated instead of
    /// closing new connections.
    pub wait_if_busy: bool,
    /// Accept backlog passed to listen(2).
    pub backlog: i32,
}

impl ListenerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            wait_if_busy: false,
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn with_wait_if_busy(mut self, wait: bool) -> Self {
        self.wait_if_busy = wait;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// `LISTEN_PORT`, when set, replaces the port of `LISTEN_ADDR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env_or("LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let mut addr: SocketAddr = raw.parse().map_err(|e| ConfigError::Parse {
            key: "LISTEN_ADDR".into(),
            value: raw.clone(),
            error: format!("{}", e),
        })?;

        if let Some(port) = env_opt("LISTEN_PORT") {
            let port: u16 = port.parse().map_err(|e| ConfigError::Parse {
                key: "LISTEN_PORT".into(),
                value: port.clone(),
                error: format!("{}", e),
            })?;
            addr.set_port(port);
        }

        let backlog = env_parse("LISTEN_BACKLOG", DEFAULT_BACKLOG)?;
        if backlog <= 0 {
            return Err(ConfigError::Invalid {
                key: "LISTEN_BACKLOG".into(),
                message: "backlog must be positive".into(),
            });
        }

        Ok(Self {
            addr,
            wait_if_busy: env_bool("WAIT_IF_BUSY", false),
            backlog,
        })
    }
}
