//! Metrics collection configuration.

use std::path::PathBuf;
use std::time::Duration;

use super::parse::{env_bool, env_duration, env_or};
use super::ConfigError;
use crate::metrics::ReportFormat;

/// Shortest accepted sampling interval.
pub const MIN_SAMPLING_INTERVAL: Duration = Duration::from_secs(10);

/// Sampling interval used when none is configured.
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_secs(30);

/// Default location of the metrics report.
pub const DEFAULT_REPORT_PATH: &str = "/var/spool/taskpoold/taskpoold.metrics";

/// Metrics configuration loaded from environment.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether the collector runs at all.
    pub enabled: bool,
    /// Time between two samples (never below [`MIN_SAMPLING_INTERVAL`]).
    interval: Duration,
    /// Report file, fully rewritten on every sample.
    pub report_path: PathBuf,
    /// Report encoding.
    pub format: ReportFormat,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_SAMPLING_INTERVAL,
            report_path: PathBuf::from(DEFAULT_REPORT_PATH),
            format: ReportFormat::Json,
        }
    }
}

impl MetricsConfig {
    pub fn new(report_path: impl Into<PathBuf>) -> Self {
        Self {
            report_path: report_path.into(),
            ..Self::default()
        }
    }

    /// Set the sampling interval, raised to [`MIN_SAMPLING_INTERVAL`] if shorter.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_SAMPLING_INTERVAL {
            tracing::warn!(
                requested_secs = interval.as_secs_f64(),
                min_secs = MIN_SAMPLING_INTERVAL.as_secs(),
                "sampling interval too short, using minimum"
            );
        }
        self.interval = interval.max(MIN_SAMPLING_INTERVAL);
        self
    }

    pub fn with_format(mut self, format: ReportFormat) -> Self {
        self.format = format;
        self
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let interval = env_duration("METRICS_INTERVAL", "30s")?.unwrap_or(DEFAULT_SAMPLING_INTERVAL);
        if interval < MIN_SAMPLING_INTERVAL {
            return Err(ConfigError::Invalid {
                key: "METRICS_INTERVAL".into(),
                message: format!("must be at least {}s", MIN_SAMPLING_INTERVAL.as_secs()),
            });
        }

        let raw_format = env_or("METRICS_FORMAT", "json");
        let format = raw_format.parse().map_err(|e: String| ConfigError::Parse {
            key: "METRICS_FORMAT".into(),
            value: raw_format.clone(),
            error: e,
        })?;

        Ok(Self {
            enabled: env_bool("METRICS_ENABLED", true),
            interval,
            report_path: PathBuf::from(env_or("METRICS_FILE", DEFAULT_REPORT_PATH)),
            format,
        })
    }
}
