//! Configuration module for taskpool daemons.
//!
//! This module provides centralized configuration loading from environment variables.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskpool::config::Config;
//!
//! let config = Config::from_env()?;
//! println!("Listen address: {}", config.listener.addr);
//! println!("Threads: {}..{}", config.pool.init_threads, config.pool.max_threads);
//! ```

mod error;
mod listener;
mod logging;
mod metrics;
mod parse;
mod pool;

pub use error::ConfigError;
pub use listener::{ListenerConfig, DEFAULT_BACKLOG, DEFAULT_LISTEN_ADDR};
pub use logging::{LogFormat, LoggingConfig};
pub use metrics::{
    MetricsConfig, DEFAULT_REPORT_PATH, DEFAULT_SAMPLING_INTERVAL, MIN_SAMPLING_INTERVAL,
};
pub use parse::{env_bool, env_duration, env_key, env_opt, env_or, env_parse, parse_duration};
pub use pool::{PoolConfig, DEFAULT_SCALE_DOWN_DELAY, MAX_THREADS_HARD_CAP};

pub(crate) use pool::threshold_for;

/// Complete daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connection handling pool (`POOL_*`).
    pub pool: PoolConfig,
    /// Listening socket.
    pub listener: ListenerConfig,
    /// Metrics collector.
    pub metrics: MetricsConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let logging = LoggingConfig::from_env()?;
        Ok(Self {
            pool: PoolConfig::from_env("POOL", format!("{}-listener", logging.service_name))?,
            listener: ListenerConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
            logging,
        })
    }

    /// Print configuration summary to log.
    pub fn log_summary(&self) {
        use tracing::info;

        info!("Configuration loaded:");
        info!("  Service: {}", self.logging.service_name);
        info!("  Listen: {}", self.listener.addr);
        info!(
            "  Threads: {} initial, {} max",
            self.pool.init_threads, self.pool.max_threads
        );
        info!(
            "  Queue: {} tasks, scale-up threshold {} ({}%)",
            self.pool.max_tasks,
            self.pool.threshold(),
            self.pool.threshold_percent
        );
        info!(
            "  Scale-down delay: {}s",
            self.pool.scale_down_delay.as_secs()
        );

        if self.listener.wait_if_busy {
            info!("  When saturated: wait");
        } else {
            info!("  When saturated: reject");
        }

        if self.metrics.enabled {
            info!(
                "  Metrics: every {}s to {:?} ({:?})",
                self.metrics.interval().as_secs(),
                self.metrics.report_path,
                self.metrics.format
            );
        } else {
            info!("  Metrics: disabled");
        }
    }
}
