//! Metrics report encoding and writing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::histogram::HistogramSnapshot;
use super::MetricsError;

/// Encoding of the report file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Pretty-printed [`MetricsSnapshot`].
    Json,
    /// Prometheus text exposition, for a textfile collector.
    Prometheus,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            other => Err(format!("unknown report format '{}'", other)),
        }
    }
}

/// Everything the collector knows at one sample.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub process: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub interval_secs: f64,
    pub histograms: Vec<HistogramSnapshot>,
}

impl MetricsSnapshot {
    pub fn render(&self, format: ReportFormat) -> Result<String, MetricsError> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Prometheus => self.render_prometheus(),
        }
    }

    fn render_prometheus(&self) -> Result<String, MetricsError> {
        let registry = Registry::new();

        let uptime = Gauge::with_opts(
            Opts::new("taskpool_uptime_seconds", "Process uptime in seconds")
                .const_label("process", &self.process),
        )?;
        registry.register(Box::new(uptime.clone()))?;
        uptime.set(self.uptime_secs as f64);

        let values = GaugeVec::new(
            Opts::new("taskpool_counter_value", "Counter value at the last sample")
                .const_label("process", &self.process),
            &["histogram", "counter", "unit"],
        )?;
        registry.register(Box::new(values.clone()))?;

        let averages = GaugeVec::new(
            Opts::new("taskpool_counter_average", "Counter moving average")
                .const_label("process", &self.process),
            &["histogram", "counter", "unit", "window"],
        )?;
        registry.register(Box::new(averages.clone()))?;

        for histogram in &self.histograms {
            for counter in &histogram.counters {
                let labels = [
                    histogram.name.as_str(),
                    counter.name.as_str(),
                    counter.unit.as_str(),
                ];
                values.with_label_values(&labels).set(counter.value);

                for (window, value) in [
                    ("1m", counter.avg_1m),
                    ("10m", counter.avg_10m),
                    ("1h", counter.avg_1h),
                ] {
                    averages
                        .with_label_values(&[labels[0], labels[1], labels[2], window])
                        .set(value);
                }
            }
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Replace `path` with `contents` through a sibling temporary file, so
/// readers never see a partial report.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), MetricsError> {
    let tmp = temp_path(path);
    let mut file = fs::File::create(&tmp).map_err(|source| MetricsError::Io {
        path: tmp.clone(),
        source,
    })?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|source| MetricsError::Io {
            path: tmp.clone(),
            source,
        })?;
    fs::rename(&tmp, path).map_err(|source| MetricsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metrics".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}
