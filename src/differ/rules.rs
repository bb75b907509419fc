//! Classification rules for the change-detection engine.
//!
//! Rules are plain data ([`DifferRules`]) that deserialize from YAML and are
//! compiled once into regexes ([`CompiledRules`]). Every pattern is matched
//! case-insensitively against the dotted field path of a change.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{DiffType, Severity};
use crate::error::DiffError;

/// One severity condition: a change type plus path patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityCondition {
    pub change_type: DiffType,
    pub patterns: Vec<String>,
}

impl SeverityCondition {
    fn new(change_type: DiffType, patterns: &[&str]) -> Self {
        Self {
            change_type,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Conditions of one severity level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityLevel {
    #[serde(default)]
    pub conditions: Vec<SeverityCondition>,
}

/// Severity rules, checked from critical down to low.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityRules {
    pub critical: SeverityLevel,
    pub high: SeverityLevel,
    pub medium: SeverityLevel,
    pub low: SeverityLevel,
    /// Relative change of a numeric update above which it is at least medium.
    pub numeric_change_ratio: f64,
    /// Severity when nothing matches.
    pub default: Severity,
}

impl Default for SeverityRules {
    fn default() -> Self {
        use DiffType::{Create, Delete, Update};

        Self {
            critical: SeverityLevel {
                conditions: vec![
                    SeverityCondition::new(
                        Delete,
                        &[r"^hardware\.(cpu|processors|memory|disks?)", r"^network\.interfaces"],
                    ),
                    SeverityCondition::new(Create, &["error", "failed", "critical"]),
                ],
            },
            high: SeverityLevel {
                conditions: vec![
                    SeverityCondition::new(
                        Update,
                        &[r"^os\.(release|version)", r"^fqdn$", r"^ipv4_address$"],
                    ),
                    SeverityCondition::new(Create, &["warning", "alert"]),
                    SeverityCondition::new(Delete, &[r"^services", r"^features"]),
                ],
            },
            medium: SeverityLevel {
                conditions: vec![
                    SeverityCondition::new(Update, &[r"^features", r"^services"]),
                    SeverityCondition::new(Create, &["info", "notice"]),
                ],
            },
            low: SeverityLevel {
                conditions: vec![
                    SeverityCondition::new(
                        Update,
                        &[
                            r"_bytes$",
                            r"load_average",
                            r"usage_percent",
                            r"temperature",
                        ],
                    ),
                    SeverityCondition::new(Create, &["debug", "trace"]),
                ],
            },
            numeric_change_ratio: 0.2,
            default: Severity::Medium,
        }
    }
}

/// Drops numeric updates smaller than `threshold_percent` on matching paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFilter {
    pub pattern: String,
    pub threshold_percent: f64,
}

impl ValueFilter {
    fn new(pattern: &str, threshold_percent: f64) -> Self {
        Self {
            pattern: pattern.to_string(),
            threshold_percent,
        }
    }
}

/// Which changes are worth recording at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceRules {
    /// Paths that are kept even when a never pattern matches.
    pub always_significant: Vec<String>,
    /// Paths whose changes are dropped.
    pub never_significant: Vec<String>,
    /// Checked in order; the first filter whose pattern matches decides.
    pub value_filters: Vec<ValueFilter>,
}

impl Default for SignificanceRules {
    fn default() -> Self {
        Self {
            always_significant: vec![r"^os\.".to_string(), r"^services\.".to_string()],
            never_significant: vec![
                "uptime".to_string(),
                "last_seen".to_string(),
                "heartbeat".to_string(),
                r"metrics\.timestamp".to_string(),
            ],
            value_filters: vec![
                ValueFilter::new("usage_percent", 5.0),
                ValueFilter::new("load_average", 10.0),
                ValueFilter::new("temperature", 5.0),
            ],
        }
    }
}

/// Processing limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffLimits {
    /// Deepest level walked key by key.
    pub max_diff_depth: usize,
    /// Diffs kept per run; the rest are dropped.
    pub max_diffs_per_run: usize,
    /// Longer field paths are skipped.
    pub max_field_path_length: usize,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_diff_depth: 10,
            max_diffs_per_run: 1000,
            max_field_path_length: 500,
        }
    }
}

/// Alert generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRules {
    /// Diffs at or above this severity raise a change alert.
    pub threshold: Severity,
    /// Changes in one category that raise a pattern alert.
    pub mass_change_threshold: usize,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            threshold: Severity::High,
            mass_change_threshold: 25,
        }
    }
}

/// Complete rule set of the change-detection engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferRules {
    pub severity: SeverityRules,
    pub significance: SignificanceRules,
    pub limits: DiffLimits,
    pub alerts: AlertRules,
}

impl DifferRules {
    /// Parses rules from YAML. Missing sections keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, DiffError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads rules from `path`, or the built-in defaults when no path is set.
    pub fn load(path: Option<&Path>) -> Result<Self, DiffError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| DiffError::RulesRead {
            path: path.to_path_buf(),
            source,
        })?;
        let rules = Self::from_yaml(&content)?;
        info!(path = %path.display(), "Loaded change-detection rules");
        Ok(rules)
    }
}

fn compile(pattern: &str) -> Result<Regex, DiffError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| DiffError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, DiffError> {
    patterns.iter().map(|p| compile(p)).collect()
}

fn compile_value_filters(filters: &[ValueFilter]) -> Result<Vec<(Regex, f64)>, DiffError> {
    let mut compiled = Vec::with_capacity(filters.len());
    for filter in filters {
        compiled.push((compile(&filter.pattern)?, filter.threshold_percent));
    }
    Ok(compiled)
}

#[derive(Debug)]
struct CompiledCondition {
    change_type: DiffType,
    patterns: Vec<Regex>,
}

/// Rules with every pattern compiled.
#[derive(Debug)]
pub struct CompiledRules {
    levels: Vec<(Severity, Vec<CompiledCondition>)>,
    numeric_change_ratio: f64,
    default_severity: Severity,
    always: Vec<Regex>,
    never: Vec<Regex>,
    value_filters: Vec<(Regex, f64)>,
    pub limits: DiffLimits,
    pub alerts: AlertRules,
}

impl CompiledRules {
    /// Compiles `rules`, failing on the first invalid pattern.
    pub fn compile(rules: &DifferRules) -> Result<Self, DiffError> {
        let level = |level: &SeverityLevel| -> Result<Vec<CompiledCondition>, DiffError> {
            level
                .conditions
                .iter()
                .map(|c| {
                    Ok(CompiledCondition {
                        change_type: c.change_type,
                        patterns: compile_all(&c.patterns)?,
                    })
                })
                .collect()
        };

        let severity = &rules.severity;
        Ok(Self {
            levels: vec![
                (Severity::Critical, level(&severity.critical)?),
                (Severity::High, level(&severity.high)?),
                (Severity::Medium, level(&severity.medium)?),
                (Severity::Low, level(&severity.low)?),
            ],
            numeric_change_ratio: severity.numeric_change_ratio,
            default_severity: severity.default,
            always: compile_all(&rules.significance.always_significant)?,
            never: compile_all(&rules.significance.never_significant)?,
            value_filters: compile_value_filters(&rules.significance.value_filters)?,
            limits: rules.limits.clone(),
            alerts: rules.alerts.clone(),
        })
    }

    /// Classifies one change.
    pub fn severity(
        &self,
        diff_type: DiffType,
        path: &str,
        previous: Option<&serde_json::Value>,
        current: Option<&serde_json::Value>,
    ) -> Severity {
        for (severity, conditions) in &self.levels {
            let matched = conditions
                .iter()
                .filter(|c| c.change_type == diff_type)
                .any(|c| c.patterns.iter().any(|p| p.is_match(path)));
            if matched {
                return *severity;
            }
        }

        if diff_type == DiffType::Update {
            if let (Some(prev), Some(curr)) = (
                previous.and_then(|v| v.as_f64()),
                current.and_then(|v| v.as_f64()),
            ) {
                if prev != 0.0 && ((curr - prev) / prev).abs() > self.numeric_change_ratio {
                    return Severity::Medium;
                }
            }
        }

        self.default_severity
    }

    /// Returns false for changes that should be dropped: never-significant
    /// paths and numeric updates below a value filter's threshold.
    pub fn is_significant(
        &self,
        path: &str,
        previous: Option<&serde_json::Value>,
        current: Option<&serde_json::Value>,
    ) -> bool {
        if self.always.iter().any(|p| p.is_match(path)) {
            return true;
        }
        if self.never.iter().any(|p| p.is_match(path)) {
            return false;
        }

        match self.value_filters.iter().find(|(p, _)| p.is_match(path)) {
            Some((_, threshold)) => !below_threshold(previous, current, *threshold),
            None => true,
        }
    }
}

/// True when both values are numbers and differ by less than
/// `threshold_percent`. A zero stays minor only while it stays zero.
fn below_threshold(
    previous: Option<&serde_json::Value>,
    current: Option<&serde_json::Value>,
    threshold_percent: f64,
) -> bool {
    let (Some(prev), Some(curr)) = (
        previous.and_then(|v| v.as_f64()),
        current.and_then(|v| v.as_f64()),
    ) else {
        return false;
    };
    if prev == 0.0 {
        return curr == 0.0;
    }
    ((curr - prev) / prev * 100.0).abs() < threshold_percent
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn defaults() -> CompiledRules {
        CompiledRules::compile(&DifferRules::default()).unwrap()
    }

    #[test]
    fn test_default_severity_levels() {
        let rules = defaults();

        assert_eq!(
            rules.severity(DiffType::Update, "os.release", None, None),
            Severity::High
        );
        assert_eq!(
            rules.severity(DiffType::Delete, "hardware.memory.total_bytes", None, None),
            Severity::Critical
        );
        assert_eq!(
            rules.severity(DiffType::Update, "hardware.memory.used_bytes", None, None),
            Severity::Low
        );
        assert_eq!(
            rules.severity(DiffType::Create, "custom.note", None, None),
            Severity::Medium
        );
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let rules = defaults();
        assert_eq!(
            rules.severity(DiffType::Update, "OS.Release", None, None),
            Severity::High
        );
    }

    #[test]
    fn test_numeric_change_ratio() {
        let yaml = "severity:\n  default: low\n";
        let rules = CompiledRules::compile(&DifferRules::from_yaml(yaml).unwrap()).unwrap();

        let big = rules.severity(
            DiffType::Update,
            "custom.count",
            Some(&json!(100)),
            Some(&json!(150)),
        );
        let small = rules.severity(
            DiffType::Update,
            "custom.count",
            Some(&json!(100)),
            Some(&json!(110)),
        );
        assert_eq!(big, Severity::Medium);
        assert_eq!(small, Severity::Low);
    }

    #[test]
    fn test_significance_filter() {
        let rules = defaults();
        assert!(!rules.is_significant("custom.uptime", None, None));
        assert!(rules.is_significant("hardware.cpu.model", None, None));
        // always beats never
        assert!(rules.is_significant("os.uptime_seconds", None, None));
    }

    #[test]
    fn test_value_filter_drops_minor_numeric_changes() {
        let yaml = r#"
significance:
  value_filters:
    - pattern: memory_total
      threshold_percent: 5
"#;
        let rules = CompiledRules::compile(&DifferRules::from_yaml(yaml).unwrap()).unwrap();
        let path = "hardware.memory_total";

        assert!(!rules.is_significant(path, Some(&json!(100)), Some(&json!(101))));
        assert!(!rules.is_significant(path, Some(&json!(100)), Some(&json!(96))));
        assert!(rules.is_significant(path, Some(&json!(100)), Some(&json!(110))));
        assert!(!rules.is_significant(path, Some(&json!(0)), Some(&json!(0))));
        assert!(rules.is_significant(path, Some(&json!(0)), Some(&json!(1))));
        // Non-numeric values and creates are never filtered by value.
        assert!(rules.is_significant(path, Some(&json!("100")), Some(&json!("101"))));
        assert!(rules.is_significant(path, None, Some(&json!(100))));
        assert!(rules.is_significant("hardware.cpu_cores", Some(&json!(100)), Some(&json!(101))));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
limits:
  max_diff_depth: 3
alerts:
  threshold: critical
"#;
        let rules = DifferRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.limits.max_diff_depth, 3);
        assert_eq!(rules.limits.max_diffs_per_run, 1000);
        assert_eq!(rules.alerts.threshold, Severity::Critical);
        assert_eq!(rules.severity, SeverityRules::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "severity:\n  high:\n    conditions:\n      - change_type: update\n        patterns: ['^custom\\.owner$']\n"
        )
        .unwrap();

        let rules = DifferRules::load(Some(file.path())).unwrap();
        let compiled = CompiledRules::compile(&rules).unwrap();
        assert_eq!(
            compiled.severity(DiffType::Update, "custom.owner", None, None),
            Severity::High
        );
        // The whole high level was replaced.
        assert_eq!(
            compiled.severity(DiffType::Update, "fqdn", None, None),
            Severity::Medium
        );
    }

    #[test]
    fn test_load_missing_file_and_bad_pattern() {
        let err = DifferRules::load(Some(Path::new("/nonexistent/rules.yml"))).unwrap_err();
        assert!(matches!(err, DiffError::RulesRead { .. }));

        let mut rules = DifferRules::default();
        rules.significance.never_significant.push("(".to_string());
        assert!(matches!(
            CompiledRules::compile(&rules),
            Err(DiffError::InvalidPattern { .. })
        ));
    }
}
