//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fleet-collect and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all fleet-collect metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages per queue and state (main, delayed, dead).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Overall queue health: 0 healthy, 1 warning, 2 critical.
pub static QUEUE_HEALTH: OnceLock<Gauge> = OnceLock::new();

/// Handled messages, labeled by queue and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Messages moved to a dead-letter list, labeled by queue.
pub static DEAD_LETTERS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Enqueues refused by the circuit breaker or backpressure gate.
pub static ENQUEUE_REJECTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Authentication attempts, labeled by result.
pub static AUTH_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Accepted inventory snapshots.
pub static INVENTORY_RECEIVED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Stored diffs, labeled by severity.
pub static DIFFS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("collect_queue_depth", "Messages per queue and state"),
        &["queue", "state"],
    )?;

    let queue_health = Gauge::new(
        "collect_queue_health",
        "Queue health: 0 healthy, 1 warning, 2 critical",
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("collect_jobs_total", "Handled queue messages"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "collect_job_duration_seconds",
            "Queue handler duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["queue"],
    )?;

    let dead_letters_total = CounterVec::new(
        Opts::new("collect_dead_letters_total", "Messages moved to dead-letter lists"),
        &["queue"],
    )?;

    let enqueue_rejected_total = CounterVec::new(
        Opts::new("collect_enqueue_rejected_total", "Enqueues refused by throttling"),
        &["queue", "reason"],
    )?;

    // Ingestion metrics
    let auth_attempts_total = CounterVec::new(
        Opts::new("collect_auth_attempts_total", "System authentication attempts"),
        &["result"],
    )?;

    let inventory_received_total = Counter::new(
        "collect_inventory_received_total",
        "Accepted inventory snapshots",
    )?;

    let diffs_total = CounterVec::new(
        Opts::new("collect_diffs_total", "Stored inventory diffs"),
        &["severity"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_health.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(dead_letters_total.clone()))?;
    registry.register(Box::new(enqueue_rejected_total.clone()))?;
    registry.register(Box::new(auth_attempts_total.clone()))?;
    registry.register(Box::new(inventory_received_total.clone()))?;
    registry.register(Box::new(diffs_total.clone()))?;

    // Statics first, registry last: a set registry means everything is in place
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_HEALTH.set(queue_health);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = DEAD_LETTERS_TOTAL.set(dead_letters_total);
    let _ = ENQUEUE_REJECTED_TOTAL.set(enqueue_rejected_total);
    let _ = AUTH_ATTEMPTS_TOTAL.set(auth_attempts_total);
    let _ = INVENTORY_RECEIVED_TOTAL.set(inventory_received_total);
    let _ = DIFFS_TOTAL.set(diffs_total);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
