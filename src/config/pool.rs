//! Worker pool configuration.

use std::time::Duration;

use super::parse::{env_duration, env_key, env_parse};
use super::ConfigError;
use crate::pool::PoolError;

/// Upper bound for the number of threads of a single pool.
pub const MAX_THREADS_HARD_CAP: usize = 100;

/// Default time an extra thread must wait after the last scaling change before retiring.
pub const DEFAULT_SCALE_DOWN_DELAY: Duration = Duration::from_secs(30);

/// Sizing and scaling parameters of a pool.
///
/// # Examples
///
/// ```
/// use taskpool::config::PoolConfig;
///
/// let config = PoolConfig::new("stager")
///     .with_threads(1, 3)
///     .with_threshold(50)
///     .with_max_tasks(10);
///
/// assert_eq!(config.threshold(), 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Pool name, used for thread names, logs and metrics.
    pub name: String,
    /// Threads started by `run()` and never retired.
    pub init_threads: usize,
    /// Upper bound for dynamically added threads.
    pub max_threads: usize,
    /// Queue fill level (percent of `max_tasks`) above which threads are added.
    pub threshold_percent: u32,
    /// Task queue capacity.
    pub max_tasks: usize,
    /// Minimum time since the last scaling change before an extra thread retires.
    pub scale_down_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            init_threads: 2,
            max_threads: num_cpus::get().max(2),
            threshold_percent: 50,
            max_tasks: 100,
            scale_down_delay: DEFAULT_SCALE_DOWN_DELAY,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the initial and maximum thread counts.
    pub fn with_threads(mut self, init: usize, max: usize) -> Self {
        self.init_threads = init;
        self.max_threads = max;
        self
    }

    /// Set the scale-up threshold as a percentage of the queue capacity.
    pub fn with_threshold(mut self, percent: u32) -> Self {
        self.threshold_percent = percent;
        self
    }

    /// Set the task queue capacity.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Set the delay extra threads wait before retiring.
    pub fn with_scale_down_delay(mut self, delay: Duration) -> Self {
        self.scale_down_delay = delay;
        self
    }

    /// Queue length above which a thread is added, below which one may retire.
    ///
    /// Zero when no scaling is possible or the percentage is out of range.
    pub fn threshold(&self) -> usize {
        threshold_for(
            self.init_threads,
            self.max_threads,
            self.threshold_percent,
            self.max_tasks,
        )
    }

    /// Check the sizing invariants.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.is_empty() {
            return Err(PoolError::InvalidConfig("pool name cannot be empty".into()));
        }
        if self.init_threads > self.max_threads {
            return Err(PoolError::InvalidConfig(format!(
                "init threads ({}) exceed max threads ({})",
                self.init_threads, self.max_threads
            )));
        }
        if self.max_threads > MAX_THREADS_HARD_CAP {
            return Err(PoolError::InvalidConfig(format!(
                "max threads ({}) exceed the hard cap of {}",
                self.max_threads, MAX_THREADS_HARD_CAP
            )));
        }
        if self.max_tasks == 0 {
            return Err(PoolError::InvalidConfig("max tasks cannot be zero".into()));
        }
        Ok(())
    }

    /// Load configuration from `{prefix}_*` environment variables.
    ///
    /// `INIT_THREADS`, `MAX_THREADS` (0 = CPU count), `THRESHOLD`,
    /// `MAX_TASKS`, `SCALE_DOWN_DELAY`.
    pub fn from_env(prefix: &str, name: impl Into<String>) -> Result<Self, ConfigError> {
        let defaults = Self::new(name);

        let init_key = env_key(prefix, "INIT_THREADS");
        let init_threads = env_parse(&init_key, defaults.init_threads)?;

        let max_key = env_key(prefix, "MAX_THREADS");
        let max_threads = match env_parse(&max_key, 0usize)? {
            0 => num_cpus::get(),
            n => n,
        }
        .max(init_threads);

        if max_threads > MAX_THREADS_HARD_CAP {
            return Err(ConfigError::Invalid {
                key: max_key,
                message: format!("cannot exceed {} threads", MAX_THREADS_HARD_CAP),
            });
        }

        let threshold_key = env_key(prefix, "THRESHOLD");
        let threshold_percent = env_parse(&threshold_key, defaults.threshold_percent)?;
        if threshold_percent > 100 {
            return Err(ConfigError::Invalid {
                key: threshold_key,
                message: "threshold is a percentage between 0 and 100".into(),
            });
        }

        let tasks_key = env_key(prefix, "MAX_TASKS");
        let max_tasks = env_parse(&tasks_key, defaults.max_tasks)?;
        if max_tasks == 0 {
            return Err(ConfigError::Invalid {
                key: tasks_key,
                message: "queue capacity cannot be zero".into(),
            });
        }

        let scale_down_delay = env_duration(&env_key(prefix, "SCALE_DOWN_DELAY"), "30s")?
            .unwrap_or(DEFAULT_SCALE_DOWN_DELAY);

        Ok(Self {
            init_threads,
            max_threads,
            threshold_percent,
            max_tasks,
            scale_down_delay,
            ..defaults
        })
    }
}

/// Compute the scaling threshold for the given sizing.
pub(crate) fn threshold_for(init: usize, max: usize, percent: u32, max_tasks: usize) -> usize {
    if init == max || percent > 100 {
        return 0;
    }
    (max_tasks as f64 * f64::from(percent) / 100.0).round() as usize
}
