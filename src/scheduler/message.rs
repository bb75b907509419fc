//! Queue message envelope.
//!
//! Every job travelling through the pipeline is wrapped in a
//! [`QueueMessage`]. The envelope is what the store holds; the payload is
//! opaque JSON interpreted by the handler for the message's [`QueueKind`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three logical queues of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Raw inventory snapshots waiting to be persisted.
    Inventory,
    /// Persisted records waiting for change detection.
    Processing,
    /// Outbound notifications.
    Notification,
}

impl QueueKind {
    /// All queue kinds, in pipeline order.
    pub const ALL: [QueueKind; 3] = [
        QueueKind::Inventory,
        QueueKind::Processing,
        QueueKind::Notification,
    ];

    /// Returns the lowercase name used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Inventory => "inventory",
            QueueKind::Processing => "processing",
            QueueKind::Notification => "notification",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inventory" => Ok(QueueKind::Inventory),
            "processing" => Ok(QueueKind::Processing),
            "notification" => Ok(QueueKind::Notification),
            other => Err(format!("unknown queue kind '{}'", other)),
        }
    }
}

/// A message stored in one of the queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Which queue the message belongs to.
    #[serde(rename = "type")]
    pub kind: QueueKind,
    /// The system that produced the work.
    pub system_id: String,
    /// Handler-specific payload.
    pub data: serde_json::Value,
    /// Number of failed deliveries so far.
    pub attempts: u32,
    /// Failed deliveries allowed before the message is dead-lettered.
    pub max_attempts: u32,
    /// When the message was first enqueued.
    pub created_at: DateTime<Utc>,
    /// Error from the most recent failed delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueMessage {
    /// Creates a fresh message with zero attempts.
    pub fn new(
        kind: QueueKind,
        system_id: impl Into<String>,
        data: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            system_id: system_id.into(),
            data,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Records a failed delivery.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.error = Some(error.into());
    }

    /// Returns true once the message has used up its attempts.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Returns the number of remaining delivery attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
