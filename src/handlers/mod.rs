//! Queue handlers of the ingestion pipeline.
//!
//! Each handler drains one queue:
//!
//! - [`InventoryHandler`]: stores the raw snapshot, then schedules processing
//! - [`ProcessingHandler`]: diffs the snapshot against its predecessor
//! - [`NotificationHandler`]: renders and dispatches notifications
//!
//! The payload types below are what travels in [`QueueMessage::data`].
//!
//! [`QueueMessage::data`]: crate::scheduler::QueueMessage

pub mod inventory;
pub mod notification;
pub mod processing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::differ::{InventoryAlert, InventoryDiff, Severity};
use crate::error::HandlerError;
use crate::storage::{StatusChange, SystemStatus};

pub use inventory::InventoryHandler;
pub use notification::{LogSink, NotificationHandler, NotificationSink};
pub use processing::ProcessingHandler;

/// A snapshot accepted by the API, waiting to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySubmission {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// A stored snapshot waiting for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub record_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Diff,
    Alert,
    SystemStatus,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Diff => "diff",
            NotificationKind::Alert => "alert",
            NotificationKind::SystemStatus => "system_status",
        }
    }
}

/// A notification waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub system_id: String,
    /// Stored ids of `diffs`, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<InventoryDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<InventoryAlert>,
    #[serde(default)]
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl NotificationJob {
    /// Notification for a system that went online or offline.
    pub fn system_status(change: &StatusChange) -> Self {
        let severity = match change.status {
            SystemStatus::Offline => Severity::High,
            _ => Severity::Low,
        };
        Self {
            kind: NotificationKind::SystemStatus,
            system_id: change.system_id.clone(),
            diff_ids: Vec::new(),
            diffs: Vec::new(),
            alert: None,
            message: format!(
                "{} (last heartbeat {})",
                change.status,
                change.last_heartbeat.to_rfc3339()
            ),
            severity,
            recipients: Vec::new(),
        }
    }
}

/// Decodes a message payload into `T`.
pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(
    data: &Value,
) -> Result<T, HandlerError> {
    T::deserialize(data).map_err(|e| HandlerError::InvalidPayload(e.to_string()))
}
