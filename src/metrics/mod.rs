//! Self-observability for pools and services.
//!
//! A [`MetricsCollector`] owns a set of [`Histogram`]s, each a group of
//! [`Counter`]s. Once per interval the collector matches buffered
//! [`Event`]s, samples every counter, updates the 1m/10m/1h moving
//! averages and rewrites the report file.

mod collector;
mod counter;
mod histogram;
mod report;

pub use collector::MetricsCollector;
pub use counter::{Counter, CounterSnapshot, Getter, AVERAGE_WINDOWS};
pub use histogram::{Event, Histogram, HistogramSnapshot};
pub use report::{write_atomic, MetricsSnapshot, ReportFormat};

use std::path::PathBuf;

/// Errors from the metrics layer.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics report I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("prometheus encoding failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("invalid histogram pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("report is not valid UTF-8: {0}")]
    Encoding(String),
}
