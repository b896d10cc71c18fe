use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use taskpool::config::Config;
use taskpool::listener::ListenerPool;
use taskpool::metrics::{Event, Histogram, MetricsCollector};
use taskpool::pool::{SignalHandle, SignalPool};
use taskpool::service::LineService;

/// Longest wait for busy workers on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Peers tracked one by one; the rest are reported together.
const MAX_PEER_COUNTERS: usize = 256;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;
    taskpool::logging::init(&config.logging);

    info!(version = taskpool::VERSION, "Starting taskpoold...");
    config.log_summary();

    let service_name = config.logging.service_name.clone();
    let collector = if config.metrics.enabled {
        let collector = Arc::new(MetricsCollector::new(&service_name, config.metrics.clone()));
        collector.add_histogram(Histogram::by_pattern("Commands", "cmd/s", r"^(\w+)")?);
        collector.add_histogram(
            Histogram::new("Peers", "cmd/s", |e: &Event| e.attr("peer").map(str::to_string))
                .with_max_counters(MAX_PEER_COUNTERS),
        );
        Some(collector)
    } else {
        None
    };

    let mut service = LineService::new();
    if let Some(collector) = &collector {
        service = service.with_collector(Arc::clone(collector));
    }

    let mut listener = ListenerPool::tcp(&config.listener, config.pool.clone(), Arc::new(service))?;
    if let Some(collector) = &collector {
        listener = listener.with_collector(Arc::clone(collector));
    }

    // Started first so the listener histograms are sampled from the first tick.
    let metrics_pool = match &collector {
        Some(collector) => {
            let pool = SignalPool::new(
                format!("{}-metrics", service_name),
                Arc::clone(collector),
                collector.config().interval(),
            )
            .with_collector(Arc::clone(collector));
            pool.run()?;
            Some(pool)
        }
        None => None,
    };

    listener.run()?;
    info!(addr = ?listener.local_addr().ok(), "taskpoold ready");

    // Single-threaded runtime, only used to wait for signals
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = runtime.block_on(wait_for_shutdown(metrics_pool.as_ref().map(SignalPool::handle))) {
        warn!(error = %e, "signal handling failed, shutting down");
    }

    info!("Shutting down...");
    if !listener.shutdown_timeout(SHUTDOWN_TIMEOUT) {
        warn!(stats = %listener.stats(), "connections still open at exit");
    }
    if let Some(pool) = metrics_pool {
        // Stopping the collector writes a last report.
        pool.shutdown_timeout(SHUTDOWN_TIMEOUT);
    }

    info!("taskpoold stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM. SIGUSR1 triggers an immediate metrics report.
#[cfg(unix)]
async fn wait_for_shutdown(metrics: Option<SignalHandle>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut flush = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result,
            _ = terminate.recv() => return Ok(()),
            _ = flush.recv() => {
                if let Some(metrics) = &metrics {
                    info!("SIGUSR1 received, writing metrics report");
                    metrics.notify();
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_metrics: Option<SignalHandle>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
