//! Periodic sampler turning pool counters and recorded events into a report.

use std::collections::HashMap;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::pool::{UnitResult, WorkerUnit};

use super::histogram::{Event, Histogram};
use super::report::{write_atomic, MetricsSnapshot};
use super::MetricsError;

/// Distinct events buffered between two samples.
pub const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// Events recorded since the last sample, identical ones folded together.
#[derive(Default)]
struct Pending {
    events: HashMap<Event, u64>,
    dropped: u64,
}

struct Histograms {
    list: Vec<Histogram>,
    last_sample: Instant,
    last_interval: Duration,
}

/// Collects histograms from pools and services and samples them.
///
/// Pools register their internal histograms when they initialize;
/// services call [`record`](Self::record). Events are buffered and only
/// matched against the histograms at sampling time, so recording stays
/// cheap on the hot path.
///
/// The collector is a [`WorkerUnit`]: run it on a
/// [`SignalPool`](crate::pool::SignalPool) with the sampling interval as
/// timeout to get one report per interval, and an extra one per notify.
pub struct MetricsCollector {
    process: String,
    pid: u32,
    started: Instant,
    config: MetricsConfig,
    histograms: Mutex<Histograms>,
    pending: Mutex<Pending>,
    pending_limit: usize,
}

impl MetricsCollector {
    pub fn new(process: impl Into<String>, config: MetricsConfig) -> Self {
        let now = Instant::now();
        Self {
            process: process.into(),
            pid: std::process::id(),
            started: now,
            config,
            histograms: Mutex::new(Histograms {
                list: Vec::new(),
                last_sample: now,
                last_interval: Duration::ZERO,
            }),
            pending: Mutex::new(Pending::default()),
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Bound the distinct events kept until the next sample. Past it, new
    /// events are dropped and counted.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn histograms(&self) -> MutexGuard<'_, Histograms> {
        self.histograms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a histogram. One with the same name is replaced.
    pub fn add_histogram(&self, histogram: Histogram) {
        let mut histograms = self.histograms();
        if let Some(pos) = histograms
            .list
            .iter()
            .position(|h| h.name() == histogram.name())
        {
            warn!(histogram = %histogram.name(), "replacing registered histogram");
            histograms.list[pos] = histogram;
        } else {
            debug!(histogram = %histogram.name(), "histogram registered");
            histograms.list.push(histogram);
        }
    }

    /// Buffer an event until the next sample.
    pub fn record(&self, event: Event) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = self.pending_limit;
        let distinct = pending.events.len();
        match pending.events.get_mut(&event) {
            Some(count) => *count += 1,
            None if distinct < limit => {
                pending.events.insert(event, 1);
            }
            None => pending.dropped += 1,
        }
    }

    /// Sample with the time elapsed since the previous sample.
    pub fn sample(&self) -> MetricsSnapshot {
        let mut histograms = self.histograms();
        let elapsed = histograms.last_sample.elapsed();
        self.sample_locked(&mut histograms, elapsed)
    }

    /// Sample as if `interval` had elapsed since the previous sample.
    pub fn sample_with_interval(&self, interval: Duration) -> MetricsSnapshot {
        let mut histograms = self.histograms();
        self.sample_locked(&mut histograms, interval)
    }

    fn sample_locked(&self, histograms: &mut Histograms, elapsed: Duration) -> MetricsSnapshot {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if pending.dropped > 0 {
            warn!(
                dropped = pending.dropped,
                limit = self.pending_limit,
                "metrics events dropped, too many distinct events between samples"
            );
        }
        let mut recorded = 0u64;
        for (event, count) in &pending.events {
            recorded += count;
            for histogram in histograms.list.iter_mut() {
                histogram.record_n(event, *count);
            }
        }

        for histogram in histograms.list.iter_mut() {
            histogram.sample(elapsed);
        }
        histograms.last_sample = Instant::now();
        histograms.last_interval = elapsed;

        debug!(
            events = recorded,
            histograms = histograms.list.len(),
            interval_secs = elapsed.as_secs_f64(),
            "metrics sampled"
        );
        self.snapshot_locked(histograms)
    }

    /// Current state without sampling.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_locked(&self.histograms())
    }

    fn snapshot_locked(&self, histograms: &Histograms) -> MetricsSnapshot {
        MetricsSnapshot {
            process: self.process.clone(),
            pid: self.pid,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            interval_secs: histograms.last_interval.as_secs_f64(),
            histograms: histograms.list.iter().map(Histogram::snapshot).collect(),
        }
    }

    /// Run `f` on the histogram called `name`, if registered.
    pub fn with_histogram<R>(&self, name: &str, f: impl FnOnce(&Histogram) -> R) -> Option<R> {
        let histograms = self.histograms();
        histograms.list.iter().find(|h| h.name() == name).map(f)
    }

    /// Write `snapshot` to the configured report path.
    pub fn write_report(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError> {
        let rendered = snapshot.render(self.config.format)?;
        write_atomic(&self.config.report_path, rendered.as_bytes())
    }

    /// Sample and write the report.
    pub fn tick(&self) -> Result<MetricsSnapshot, MetricsError> {
        let snapshot = self.sample();
        self.write_report(&snapshot)?;
        Ok(snapshot)
    }
}

impl WorkerUnit for MetricsCollector {
    type Task = ();

    fn init(&self) -> UnitResult {
        if let Some(dir) = self.config.report_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|source| MetricsError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn run(&self, _: ()) -> UnitResult {
        self.tick()?;
        Ok(())
    }

    fn stop(&self) {
        if let Err(e) = self.write_report(&self.snapshot()) {
            warn!(error = %e, "final metrics report not written");
        }
    }
}
