//! High-level metrics recording.
//!
//! [`MetricsCollector`] hides the Prometheus statics behind calls phrased in
//! pipeline terms. Every method is a no-op until
//! [`init_metrics`](super::init_metrics) has run, so library code and tests
//! never need to care whether metrics are enabled.

use std::time::Duration;

use super::prometheus::{
    AUTH_ATTEMPTS_TOTAL, DEAD_LETTERS_TOTAL, DIFFS_TOTAL, ENQUEUE_REJECTED_TOTAL,
    INVENTORY_RECEIVED_TOTAL, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, QUEUE_HEALTH,
};
use crate::differ::Severity;
use crate::scheduler::{Health, QueueKind, QueueStats};

/// Records pipeline metrics into the global registry.
///
/// # Example
///
/// ```ignore
/// let collector = MetricsCollector::new();
/// collector.record_job(QueueKind::Inventory, "success", Duration::from_millis(12));
/// collector.record_auth("success");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Records one handled message.
    ///
    /// # Arguments
    ///
    /// * `kind` - Queue the message came from
    /// * `outcome` - "success" or "failure"
    /// * `duration` - Time spent in the handler
    pub fn record_job(&self, kind: QueueKind, outcome: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[kind.as_str(), outcome])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[kind.as_str()])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = %kind,
            outcome = outcome,
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Records a message moved to a dead-letter list.
    pub fn record_dead_letter(&self, kind: QueueKind) {
        if let Some(dead_letters) = DEAD_LETTERS_TOTAL.get() {
            dead_letters.with_label_values(&[kind.as_str()]).inc();
        }
    }

    /// Records an enqueue refused by the breaker or backpressure gate.
    pub fn record_enqueue_rejected(&self, kind: QueueKind, reason: &str) {
        if let Some(rejected) = ENQUEUE_REJECTED_TOTAL.get() {
            rejected.with_label_values(&[kind.as_str(), reason]).inc();
        }
    }

    /// Records an authentication attempt.
    ///
    /// # Arguments
    ///
    /// * `result` - "success" or the failure reason
    pub fn record_auth(&self, result: &str) {
        if let Some(auth_attempts) = AUTH_ATTEMPTS_TOTAL.get() {
            auth_attempts.with_label_values(&[result]).inc();
        }
    }

    /// Records an accepted inventory snapshot.
    pub fn record_inventory_received(&self) {
        if let Some(received) = INVENTORY_RECEIVED_TOTAL.get() {
            received.inc();
        }
    }

    /// Records stored diffs by severity.
    pub fn record_diffs<'a>(&self, severities: impl IntoIterator<Item = &'a Severity>) {
        let Some(diffs_total) = DIFFS_TOTAL.get() else {
            return;
        };
        for severity in severities {
            diffs_total.with_label_values(&[severity.as_str()]).inc();
        }
    }

    /// Publishes queue depths and health from a stats snapshot.
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for depth in &stats.queues {
                let queue = depth.queue.as_str();
                queue_depth
                    .with_label_values(&[queue, "main"])
                    .set(depth.main as f64);
                queue_depth
                    .with_label_values(&[queue, "delayed"])
                    .set(depth.delayed as f64);
                queue_depth
                    .with_label_values(&[queue, "dead"])
                    .set(depth.dead as f64);
            }
        }

        if let Some(health) = QUEUE_HEALTH.get() {
            let value = match stats.queue_health {
                Health::Healthy => 0.0,
                Health::Warning => 1.0,
                Health::Critical => 2.0,
            };
            health.set(value);
        }

        tracing::trace!(
            pending = stats.pending_jobs,
            failed = stats.failed_jobs,
            health = %stats.queue_health,
            "Updated queue metrics"
        );
    }
}
