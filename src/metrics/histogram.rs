//! Named groups of counters.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use super::counter::{Counter, CounterSnapshot};
use super::MetricsError;

/// Something that happened and may be counted, e.g. a served command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Counters an event histogram creates on its own, the overflow counter
/// excluded.
pub const DEFAULT_MAX_COUNTERS: usize = 1000;

/// Counter taking the events of new keys once the limit is reached.
pub const OVERFLOW_COUNTER: &str = "other";

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;
type Classifier = Box<dyn Fn(&Event) -> Option<String> + Send + Sync>;
type SampleHook = Box<dyn Fn() + Send + Sync>;

enum Matcher {
    /// Supplied with [`Histogram::with_counter`].
    Predicate(Predicate),
    /// Created by the classifier for one key.
    Key(String),
    /// Catches new keys past the counter limit.
    Overflow,
    /// Gauges ignore events.
    Never,
}

struct Slot {
    matcher: Matcher,
    counter: Counter,
}

/// A set of counters sharing a name and unit.
///
/// Every counter of an event histogram carries a match predicate. A
/// recorded [`Event`] increments the first counter whose predicate
/// accepts it. When none does, the classifier (if any) names a new
/// counter for it, up to [`DEFAULT_MAX_COUNTERS`]; later keys all land
/// in [`OVERFLOW_COUNTER`]. Internal histograms hold gauges bound to a
/// pool and ignore events.
pub struct Histogram {
    name: String,
    unit: String,
    slots: Vec<Slot>,
    classifier: Option<Classifier>,
    max_counters: usize,
    on_sample: Option<SampleHook>,
}

impl Histogram {
    fn empty(name: String, unit: String, classifier: Option<Classifier>) -> Self {
        Self {
            name,
            unit,
            slots: Vec::new(),
            classifier,
            max_counters: DEFAULT_MAX_COUNTERS,
            on_sample: None,
        }
    }

    /// Event histogram creating one counter per key returned by
    /// `classifier`. Events it maps to `None` are not counted here.
    pub fn new<F>(name: impl Into<String>, unit: impl Into<String>, classifier: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        Self::empty(name.into(), unit.into(), Some(Box::new(classifier)))
    }

    /// Event histogram with only the counters added by
    /// [`with_counter`](Self::with_counter).
    ///
    /// # Examples
    ///
    /// ```
    /// use taskpool::metrics::{Event, Histogram};
    ///
    /// let mut sizes = Histogram::matching("Sizes", "req/s")
    ///     .with_counter("small", |e: &Event| e.name.len() < 8)
    ///     .with_counter("any", |_: &Event| true);
    /// assert!(sizes.record(&Event::new("get")));
    /// assert!(sizes.record(&Event::new("stage /archive/file")));
    /// assert_eq!(sizes.counters().len(), 2);
    /// ```
    pub fn matching(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::empty(name.into(), unit.into(), None)
    }

    /// Event histogram keyed on the event name matched against `pattern`.
    ///
    /// The key is the first capture group, or the whole match if the
    /// pattern has no group.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskpool::metrics::{Event, Histogram};
    ///
    /// let mut commands = Histogram::by_pattern("Commands", "cmd/s", r"^(\w+)").unwrap();
    /// assert!(commands.record(&Event::new("stage file1")));
    /// assert!(commands.counter("stage").is_some());
    /// ```
    pub fn by_pattern(
        name: impl Into<String>,
        unit: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, MetricsError> {
        let regex = Regex::new(pattern)?;
        Ok(Self::new(name, unit, move |event: &Event| {
            let captures = regex.captures(&event.name)?;
            captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
        }))
    }

    /// Histogram without classifier, filled with [`with_gauge`](Self::with_gauge).
    pub fn internal(name: impl Into<String>) -> Self {
        Self::empty(name.into(), String::new(), None)
    }

    /// Add an event counter matched by `predicate`. Counters are tried in
    /// the order they were added, before any created by the classifier.
    pub fn with_counter<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let counter = Counter::events(name, self.unit.clone());
        self.slots.push(Slot {
            matcher: Matcher::Predicate(Box::new(predicate)),
            counter,
        });
        self
    }

    pub fn with_gauge<F>(mut self, name: &str, unit: &str, getter: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.slots.push(Slot {
            matcher: Matcher::Never,
            counter: Counter::gauge(name, unit, getter),
        });
        self
    }

    /// Limit the counters the classifier may create.
    pub fn with_max_counters(mut self, max: usize) -> Self {
        self.max_counters = max;
        self
    }

    /// Hook run after every sample, typically to reset the accumulators
    /// the gauges read.
    pub fn on_sample<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_sample = Some(Box::new(hook));
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Count `event` once. Returns whether a counter took it.
    pub fn record(&mut self, event: &Event) -> bool {
        self.record_n(event, 1)
    }

    /// Count `n` occurrences of `event`.
    pub fn record_n(&mut self, event: &Event, n: u64) -> bool {
        let key = self.classifier.as_ref().and_then(|classify| classify(event));

        for slot in &mut self.slots {
            let hit = match &slot.matcher {
                Matcher::Predicate(predicate) => predicate(event),
                Matcher::Key(k) => key.as_deref() == Some(k.as_str()),
                Matcher::Overflow | Matcher::Never => false,
            };
            if hit {
                slot.counter.add(n);
                return true;
            }
        }

        let Some(key) = key else {
            return false;
        };
        let created = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.matcher, Matcher::Key(_)))
            .count();

        if created < self.max_counters {
            let mut counter = Counter::events(key.as_str(), self.unit.clone());
            counter.add(n);
            self.slots.push(Slot {
                matcher: Matcher::Key(key),
                counter,
            });
            return true;
        }

        match self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot.matcher, Matcher::Overflow))
        {
            Some(slot) => slot.counter.add(n),
            None => {
                let mut counter = Counter::events(OVERFLOW_COUNTER, self.unit.clone());
                counter.add(n);
                self.slots.push(Slot {
                    matcher: Matcher::Overflow,
                    counter,
                });
            }
        }
        true
    }

    /// Sample every counter, then run the sample hook.
    pub fn sample(&mut self, elapsed: Duration) {
        for slot in &mut self.slots {
            slot.counter.sample(elapsed);
        }
        if let Some(hook) = &self.on_sample {
            hook();
        }
    }

    pub fn counter(&self, name: &str) -> Option<&Counter> {
        self.counters().find(|c| c.name() == name)
    }

    pub fn counters(&self) -> impl ExactSizeIterator<Item = &Counter> + '_ {
        self.slots.iter().map(|slot| &slot.counter)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            name: self.name.clone(),
            unit: self.unit.clone(),
            counters: self.counters().map(Counter::snapshot).collect(),
        }
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("counters", &self.counters().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramSnapshot {
    pub name: String,
    pub unit: String,
    pub counters: Vec<CounterSnapshot>,
}
