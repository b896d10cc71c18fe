//! Counters with exponentially weighted moving averages.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Windows of the three moving averages: 1 minute, 10 minutes, 1 hour.
pub const AVERAGE_WINDOWS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(600),
    Duration::from_secs(3600),
];

/// Reads the instantaneous level of a gauge counter.
pub type Getter = Arc<dyn Fn() -> f64 + Send + Sync>;

enum Source {
    /// Events counted through [`Counter::inc`]; the value is a rate per second.
    Events { pending: u64 },
    /// Level read from a getter at every sample.
    Gauge(Getter),
}

/// A named value sampled once per collector interval.
///
/// Averages are updated like Unix load averages: each sample moves them
/// towards the current value by `1 - exp(-interval / window)`, so they
/// follow the recent level rather than the mean since start.
pub struct Counter {
    name: String,
    unit: String,
    value: f64,
    last_value: f64,
    averages: [f64; 3],
    samples: u64,
    source: Source,
}

impl Counter {
    /// Event counter reporting a per-second rate.
    pub fn events(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::with_source(name.into(), unit.into(), Source::Events { pending: 0 })
    }

    /// Counter reading its value from `getter` at every sample.
    pub fn gauge<F>(name: impl Into<String>, unit: impl Into<String>, getter: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::with_source(name.into(), unit.into(), Source::Gauge(Arc::new(getter)))
    }

    fn with_source(name: String, unit: String, source: Source) -> Self {
        Self {
            name,
            unit,
            value: 0.0,
            last_value: 0.0,
            averages: [0.0; 3],
            samples: 0,
            source,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Value computed at the last sample.
    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Value computed at the sample before the last one.
    #[inline]
    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    pub fn is_gauge(&self) -> bool {
        matches!(self.source, Source::Gauge(_))
    }

    /// Count one event. No effect on gauges.
    pub fn inc(&mut self) {
        self.add(1);
    }

    pub fn add(&mut self, n: u64) {
        if let Source::Events { pending } = &mut self.source {
            *pending += n;
        }
    }

    /// Moving averages over [`AVERAGE_WINDOWS`].
    pub fn averages(&self) -> [f64; 3] {
        self.averages
    }

    /// The 1 minute moving average.
    pub fn moving_average(&self) -> f64 {
        self.averages[0]
    }

    /// Compute the new value for an interval of `elapsed` and fold it into
    /// the moving averages.
    pub fn sample(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let current = match &mut self.source {
            Source::Events { pending } => {
                let count = std::mem::take(pending) as f64;
                if secs > 0.0 {
                    count / secs
                } else {
                    0.0
                }
            }
            Source::Gauge(getter) => getter(),
        };

        self.last_value = self.value;
        self.value = current;
        for (average, window) in self.averages.iter_mut().zip(AVERAGE_WINDOWS) {
            let alpha = 1.0 - (-secs / window.as_secs_f64()).exp();
            *average += alpha * (current - *average);
        }
        self.samples += 1;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            name: self.name.clone(),
            unit: self.unit.clone(),
            value: self.value,
            last_value: self.last_value,
            avg_1m: self.averages[0],
            avg_10m: self.averages[1],
            avg_1h: self.averages[2],
            samples: self.samples,
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("value", &self.value)
            .field("averages", &self.averages)
            .field("gauge", &self.is_gauge())
            .finish()
    }
}

/// Serializable state of a [`Counter`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub last_value: f64,
    pub avg_1m: f64,
    pub avg_10m: f64,
    pub avg_1h: f64,
    pub samples: u64,
}
