//! Pool metrics flowing into the collector and its report.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use taskpool::config::{ListenerConfig, MetricsConfig, PoolConfig};
use taskpool::listener::ListenerPool;
use taskpool::metrics::{Histogram, MetricsCollector, ReportFormat};
use taskpool::pool::{DynamicPool, FnUnit, SignalPool};
use taskpool::service::LineService;

use crate::helpers::*;

fn collector(dir: &tempfile::TempDir, format: ReportFormat) -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new(
        "taskpoold",
        MetricsConfig::new(dir.path().join("taskpoold.metrics")).with_format(format),
    ))
}

fn counter_value(collector: &MetricsCollector, histogram: &str, counter: &str) -> f64 {
    collector
        .with_histogram(histogram, |h| h.counter(counter).map(|c| c.value()))
        .flatten()
        .unwrap_or_else(|| panic!("missing counter {}/{}", histogram, counter))
}

fn moving_average(collector: &MetricsCollector, histogram: &str, counter: &str) -> f64 {
    collector
        .with_histogram(histogram, |h| h.counter(counter).map(|c| c.moving_average()))
        .flatten()
        .unwrap_or_else(|| panic!("missing counter {}/{}", histogram, counter))
}

#[test]
fn test_pool_registers_its_counters() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector(&dir, ReportFormat::Json);
    let unit = FnUnit::new(|_: u32| Ok(()));
    let pool = DynamicPool::new(PoolConfig::new("stager").with_threads(2, 4), Arc::new(unit))
        .unwrap()
        .with_collector(Arc::clone(&collector));
    pool.run().unwrap();

    let snapshot = collector.sample_with_interval(Duration::from_secs(30));
    let names: Vec<&str> = snapshot.histograms[0]
        .counters
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    for expected in [
        "Threads",
        "LoadFactor",
        "ActivityFactor",
        "ProcessingTime",
        "BacklogFactor",
        "QueuingTime",
    ] {
        assert!(names.contains(&expected), "missing {}", expected);
    }
    assert_eq!(counter_value(&collector, "stager", "Threads"), 2.0);
    assert!(pool.shutdown(true));
}

/// With nothing happening, averages converge to the getter's level.
#[test]
fn test_idle_pool_averages_converge() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector(&dir, ReportFormat::Json);
    let unit = FnUnit::new(|_: u32| Ok(()));
    let pool = DynamicPool::new(PoolConfig::new("idle").with_threads(3, 3), Arc::new(unit))
        .unwrap()
        .with_collector(Arc::clone(&collector));
    pool.run().unwrap();

    for _ in 0..30 {
        collector.sample_with_interval(Duration::from_secs(60));
    }
    assert!((moving_average(&collector, "idle", "Threads") - 3.0).abs() < 1e-6);
    assert_eq!(moving_average(&collector, "idle", "LoadFactor"), 0.0);
    assert!(pool.shutdown(true));
}

/// Accumulators are reset after each sample.
#[test]
fn test_processing_time_reset_between_samples() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector(&dir, ReportFormat::Json);
    let unit = FnUnit::new(|_: u32| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    });
    let pool = DynamicPool::new(PoolConfig::new("timed").with_threads(1, 1), Arc::new(unit))
        .unwrap()
        .with_collector(Arc::clone(&collector));
    pool.run().unwrap();

    for i in 0..3 {
        pool.add_task(i, true).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || pool.stats().processed_tasks == 3));

    collector.sample_with_interval(Duration::from_secs(30));
    assert!(counter_value(&collector, "timed", "ProcessingTime") >= 15.0);

    collector.sample_with_interval(Duration::from_secs(30));
    assert_eq!(counter_value(&collector, "timed", "ProcessingTime"), 0.0);
    assert!(pool.shutdown(true));
}

/// End to end: served commands are counted and a report is written on notify.
#[test]
fn test_collector_on_signal_pool_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector(&dir, ReportFormat::Json);
    collector.add_histogram(Histogram::by_pattern("Commands", "cmd/s", r"^(\w+)").unwrap());

    let service = LineService::new().with_collector(Arc::clone(&collector));
    let listener = ListenerPool::tcp(
        &ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
        PoolConfig::new("lines").with_threads(1, 2),
        Arc::new(service),
    )
    .unwrap()
    .with_collector(Arc::clone(&collector));
    listener.run().unwrap();

    let metrics = SignalPool::new("metrics", Arc::clone(&collector), Duration::from_secs(3600))
        .with_collector(Arc::clone(&collector));
    metrics.run().unwrap();

    let mut stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"PING\nPING\nQUIT\n").unwrap();
    let replies = BufReader::new(stream).lines().count();
    assert_eq!(replies, 3);

    let report_path = collector.config().report_path.clone();
    metrics.notify();
    assert!(wait_until(Duration::from_secs(5), || report_path.exists()));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["process"], "taskpoold");
    let histograms = report["histograms"].as_array().unwrap();
    let names: Vec<&str> = histograms.iter().filter_map(|h| h["name"].as_str()).collect();
    assert!(names.contains(&"Commands"));
    assert!(names.contains(&"lines"));
    assert!(names.contains(&"metrics"));

    let commands = histograms.iter().find(|h| h["name"] == "Commands").unwrap();
    let counters: Vec<&str> = commands["counters"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(counters.contains(&"PING"));
    assert!(counters.contains(&"QUIT"));

    assert!(listener.shutdown_timeout(Duration::from_secs(5)));
    assert!(metrics.shutdown(true));
}

#[test]
fn test_prometheus_report_from_pool() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector(&dir, ReportFormat::Prometheus);
    let unit = FnUnit::new(|_: u32| Ok(()));
    let pool = DynamicPool::new(PoolConfig::new("prom").with_threads(1, 2), Arc::new(unit))
        .unwrap()
        .with_collector(Arc::clone(&collector));
    pool.run().unwrap();

    collector.tick().unwrap();
    let text = std::fs::read_to_string(&collector.config().report_path).unwrap();
    assert!(text.contains("taskpool_counter_value"));
    assert!(text.contains("histogram=\"prom\""));
    assert!(text.contains("counter=\"BacklogFactor\""));
    assert!(pool.shutdown(true));
}
