//! Change detection between consecutive inventory snapshots.
//!
//! The [`DiffEngine`] walks two JSON trees in lock-step and reports every
//! leaf that was created, updated or deleted. Each change gets a
//! [`Category`] from its top-level key and a [`Severity`] from the
//! configurable [`DifferRules`]. Changes at or above the alert threshold
//! become [`InventoryAlert`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_collect::differ::{DiffEngine, DifferRules};
//!
//! let engine = DiffEngine::new(&DifferRules::default())?;
//! let report = engine.compute("sys-1", Some((1, &previous)), (2, &current));
//! for diff in &report.diffs {
//!     println!("{} {} ({})", diff.diff_type, diff.field_path, diff.severity);
//! }
//! ```

pub mod engine;
pub mod rules;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::{DiffEngine, DiffReport};
pub use rules::{
    AlertRules, CompiledRules, DiffLimits, DifferRules, SeverityCondition, SeverityLevel,
    SeverityRules, SignificanceRules, ValueFilter,
};

/// Kind of change at a field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffType {
    Create,
    Update,
    Delete,
}

impl DiffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffType::Create => "create",
            DiffType::Update => "update",
            DiffType::Delete => "delete",
        }
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a change or alert, ordered from low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Area of the inventory a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Os,
    Hardware,
    Network,
    Services,
    Features,
    System,
}

impl Category {
    /// Maps a field path to its category by the top-level key.
    pub fn from_path(path: &str) -> Self {
        let top = path
            .split(|c| c == '.' || c == '[')
            .next()
            .unwrap_or_default();
        match top {
            "os" => Category::Os,
            "hardware" => Category::Hardware,
            "network" => Category::Network,
            "services" => Category::Services,
            "features" => Category::Features,
            _ => Category::System,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Os => "os",
            Category::Hardware => "hardware",
            Category::Network => "network",
            Category::Services => "services",
            Category::Features => "features",
            Category::System => "system",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    /// A single significant change.
    Change,
    /// Many changes in one category at once.
    Pattern,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Change => "change",
            AlertType::Pattern => "pattern",
        }
    }
}

/// One field-level change between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryDiff {
    pub system_id: String,
    /// `None` only for the first inventory of a system.
    pub previous_id: Option<i64>,
    pub current_id: i64,
    pub diff_type: DiffType,
    pub field_path: String,
    pub previous_value: Option<serde_json::Value>,
    pub current_value: Option<serde_json::Value>,
    pub severity: Severity,
    pub category: Category,
    #[serde(default)]
    pub notification_sent: bool,
}

/// Human-facing notice derived from diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAlert {
    pub system_id: String,
    /// Stored diff the alert refers to, set once diffs are persisted.
    pub diff_id: Option<i64>,
    /// Position of the related diff in the report.
    #[serde(skip)]
    pub diff_index: Option<usize>,
    pub alert_type: AlertType,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}
