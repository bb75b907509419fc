//! Error types shared across fleet-collect subsystems.
//!
//! Subsystems with a single owner keep their error enum next to the code
//! (`StoreError`, `QueueError`, `PoolError`, `DatabaseError`, `ConfigError`,
//! `ApiError`). The enums here cross module boundaries:
//! - Queue handlers, which touch the queue, the database and the differ
//! - Change-detection rule loading

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::QueueError;
use crate::storage::DatabaseError;

/// Errors raised by queue handlers.
///
/// Every variant leads to a requeue; the message text ends up in the
/// message's `error` field and, once attempts are exhausted, in the
/// dead-letter list.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Inventory record {0} not found")]
    RecordNotFound(i64),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading change-detection rules.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Failed to read rules file '{path}': {source}")]
    RulesRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rules: {0}")]
    RulesParse(#[from] serde_yaml::Error),

    #[error("Invalid path pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
