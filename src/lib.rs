//! taskpool - dynamic worker pools for daemon processes.
//!
//! Daemons hand their work to pools of OS threads that grow with the
//! backlog and shrink back when it clears.
//!
//! # Features
//!
//! - **Dynamic pools**: bounded task queue, threads added above a backlog
//!   threshold and retired after a quiet period
//! - **Listener pools**: TCP or UDP accept loop dispatching connections,
//!   with wait-or-reject behaviour when saturated
//! - **Signal pools**: periodic jobs that can also be triggered on demand
//! - **Metrics**: moving averages of pool and service counters, written
//!   as JSON or Prometheus text
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskpool::config::PoolConfig;
//! use taskpool::pool::{DynamicPool, FnUnit};
//!
//! let unit = FnUnit::new(|path: String| {
//!     println!("staging {}", path);
//!     Ok(())
//! });
//! let pool = DynamicPool::new(PoolConfig::new("stager").with_threads(2, 8), Arc::new(unit))?;
//! pool.run()?;
//! let _ = pool.add_task("/archive/file1".to_string(), true);
//! pool.shutdown(true);
//! # Ok::<(), taskpool::pool::PoolError>(())
//! ```

/// Package version from Cargo.toml
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (8 chars), empty when built outside a checkout
pub const BUILD_VERSION: &str = env!("BUILD_VERSION");

/// Full version string: "0.1.0 (abc12345)"
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_VERSION"), ")");

pub mod config;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod service;

// Re-exports for convenience
pub use config::Config;
pub use listener::ListenerPool;
pub use metrics::MetricsCollector;
pub use pool::{DynamicPool, PoolError, SignalPool, WorkerUnit};
