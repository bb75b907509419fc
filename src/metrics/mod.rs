//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue depths and health, handler outcomes, authentication attempts
//! and change detection.
//!
//! # Example
//!
//! ```ignore
//! use fleet_collect::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//!
//! let collector = MetricsCollector::new();
//! collector.record_auth("success");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics, metrics_handler};

pub use self::prometheus::{
    AUTH_ATTEMPTS_TOTAL, DEAD_LETTERS_TOTAL, DIFFS_TOTAL, ENQUEUE_REJECTED_TOTAL,
    INVENTORY_RECEIVED_TOTAL, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, QUEUE_HEALTH, REGISTRY,
};
