//! Recursive JSON diff with classification.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::rules::{CompiledRules, DifferRules};
use super::{AlertType, Category, DiffType, InventoryAlert, InventoryDiff, Severity};
use crate::error::DiffError;

/// Result of comparing two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    pub diffs: Vec<InventoryDiff>,
    pub alerts: Vec<InventoryAlert>,
    pub has_changes: bool,
    pub change_count: usize,
    /// True when `max_diffs_per_run` cut the list short.
    pub truncated: bool,
}

impl DiffReport {
    /// Highest severity among the diffs.
    pub fn max_severity(&self) -> Option<Severity> {
        self.diffs.iter().map(|d| d.severity).max()
    }
}

/// A change before classification.
#[derive(Debug, Clone, PartialEq)]
struct RawChange {
    diff_type: DiffType,
    path: String,
    previous: Option<Value>,
    current: Option<Value>,
}

/// Shape of a JSON value; a change of shape is never an update.
#[derive(PartialEq)]
enum Shape {
    Object,
    Array,
    Scalar,
}

fn shape(value: &Value) -> Shape {
    match value {
        Value::Object(_) => Shape::Object,
        Value::Array(_) => Shape::Array,
        _ => Shape::Scalar,
    }
}

fn child_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn child_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

/// Compares inventory snapshots and classifies the differences.
#[derive(Debug)]
pub struct DiffEngine {
    rules: CompiledRules,
}

impl DiffEngine {
    /// Creates an engine from `rules`.
    pub fn new(rules: &DifferRules) -> Result<Self, DiffError> {
        Ok(Self {
            rules: CompiledRules::compile(rules)?,
        })
    }

    /// Returns the compiled rules.
    pub fn rules(&self) -> &CompiledRules {
        &self.rules
    }

    /// Diffs `current` against `previous`.
    ///
    /// With no previous snapshot every leaf of `current` is a create and no
    /// pattern alerts are raised.
    pub fn compute(
        &self,
        system_id: &str,
        previous: Option<(i64, &Value)>,
        current: (i64, &Value),
    ) -> DiffReport {
        let (current_id, current_data) = current;
        let previous_id = previous.map(|(id, _)| id);

        let mut changes = Vec::new();
        match previous {
            Some((_, prev)) => self.walk("", 0, prev, current_data, &mut changes),
            None => self.leaves("", 0, DiffType::Create, current_data, &mut changes),
        }

        let limits = &self.rules.limits;
        let mut truncated = false;
        let mut diffs = Vec::new();
        for change in changes {
            if change.path.len() > limits.max_field_path_length {
                debug!(system_id = %system_id, path_len = change.path.len(), "Skipping overlong field path");
                continue;
            }
            if !self.rules.is_significant(
                &change.path,
                change.previous.as_ref(),
                change.current.as_ref(),
            ) {
                continue;
            }
            if diffs.len() >= limits.max_diffs_per_run {
                truncated = true;
                break;
            }

            let severity = self.rules.severity(
                change.diff_type,
                &change.path,
                change.previous.as_ref(),
                change.current.as_ref(),
            );
            diffs.push(InventoryDiff {
                system_id: system_id.to_string(),
                previous_id,
                current_id,
                diff_type: change.diff_type,
                category: Category::from_path(&change.path),
                field_path: change.path,
                previous_value: change.previous,
                current_value: change.current,
                severity,
                notification_sent: false,
            });
        }

        if truncated {
            warn!(
                system_id = %system_id,
                current_id = current_id,
                limit = limits.max_diffs_per_run,
                "Diff limit reached, remaining changes dropped"
            );
        }

        let alerts = self.alerts(system_id, previous_id.is_some(), &diffs);
        let change_count = diffs.len();

        debug!(
            system_id = %system_id,
            current_id = current_id,
            previous_id = ?previous_id,
            changes = change_count,
            alerts = alerts.len(),
            "Computed inventory diff"
        );

        DiffReport {
            has_changes: change_count > 0,
            change_count,
            diffs,
            alerts,
            truncated,
        }
    }

    fn walk(&self, path: &str, depth: usize, prev: &Value, curr: &Value, out: &mut Vec<RawChange>) {
        if shape(prev) != shape(curr) {
            self.leaves(path, depth, DiffType::Delete, prev, out);
            self.leaves(path, depth, DiffType::Create, curr, out);
            return;
        }
        if prev == curr {
            return;
        }

        let bounded = depth >= self.rules.limits.max_diff_depth;
        match (prev, curr) {
            (Value::Object(p), Value::Object(c)) if !bounded => {
                let keys: BTreeSet<&String> = p.keys().chain(c.keys()).collect();
                for key in keys {
                    let child = child_key(path, key);
                    match (p.get(key), c.get(key)) {
                        (Some(pv), Some(cv)) => self.walk(&child, depth + 1, pv, cv, out),
                        (Some(pv), None) => self.leaves(&child, depth + 1, DiffType::Delete, pv, out),
                        (None, Some(cv)) => self.leaves(&child, depth + 1, DiffType::Create, cv, out),
                        (None, None) => {}
                    }
                }
            }
            (Value::Array(p), Value::Array(c)) if !bounded => {
                for i in 0..p.len().max(c.len()) {
                    let child = child_index(path, i);
                    match (p.get(i), c.get(i)) {
                        (Some(pv), Some(cv)) => self.walk(&child, depth + 1, pv, cv, out),
                        (Some(pv), None) => self.leaves(&child, depth + 1, DiffType::Delete, pv, out),
                        (None, Some(cv)) => self.leaves(&child, depth + 1, DiffType::Create, cv, out),
                        (None, None) => {}
                    }
                }
            }
            // Scalars, or containers at the depth bound compared as a whole.
            _ => out.push(RawChange {
                diff_type: DiffType::Update,
                path: path.to_string(),
                previous: Some(prev.clone()),
                current: Some(curr.clone()),
            }),
        }
    }

    /// Reports every leaf under `value` as `diff_type`.
    fn leaves(&self, path: &str, depth: usize, diff_type: DiffType, value: &Value, out: &mut Vec<RawChange>) {
        let bounded = depth >= self.rules.limits.max_diff_depth;
        match value {
            Value::Object(map) if !bounded && !map.is_empty() => {
                for (key, v) in map {
                    let child = child_key(path, key);
                    self.leaves(&child, depth + 1, diff_type, v, out);
                }
            }
            Value::Array(items) if !bounded && !items.is_empty() => {
                for (i, v) in items.iter().enumerate() {
                    let child = child_index(path, i);
                    self.leaves(&child, depth + 1, diff_type, v, out);
                }
            }
            // An empty root has no leaf to report.
            _ if path.is_empty() => {}
            _ => {
                let (previous, current) = match diff_type {
                    DiffType::Delete => (Some(value.clone()), None),
                    _ => (None, Some(value.clone())),
                };
                out.push(RawChange {
                    diff_type,
                    path: path.to_string(),
                    previous,
                    current,
                });
            }
        }
    }

    fn alerts(&self, system_id: &str, has_previous: bool, diffs: &[InventoryDiff]) -> Vec<InventoryAlert> {
        let threshold = self.rules.alerts.threshold;
        let mut alerts: Vec<InventoryAlert> = diffs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.severity >= threshold)
            .map(|(i, d)| InventoryAlert {
                system_id: system_id.to_string(),
                diff_id: None,
                diff_index: Some(i),
                alert_type: AlertType::Change,
                message: format!(
                    "{} change: {} {}",
                    d.severity, d.diff_type, d.field_path
                ),
                severity: d.severity,
                is_resolved: false,
                resolved_at: None,
            })
            .collect();

        if !has_previous {
            return alerts;
        }

        let mut per_category: BTreeMap<Category, usize> = BTreeMap::new();
        for diff in diffs {
            *per_category.entry(diff.category).or_default() += 1;
        }
        let mass = self.rules.alerts.mass_change_threshold;
        for (category, count) in per_category {
            if mass > 0 && count >= mass {
                alerts.push(InventoryAlert {
                    system_id: system_id.to_string(),
                    diff_id: None,
                    diff_index: None,
                    alert_type: AlertType::Pattern,
                    message: format!("{} changes in category {}", count, category),
                    severity: Severity::High,
                    is_resolved: false,
                    resolved_at: None,
                });
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::rules::DiffLimits;
    use serde_json::json;

    fn engine() -> DiffEngine {
        DiffEngine::new(&DifferRules::default()).unwrap()
    }

    fn find<'a>(report: &'a DiffReport, path: &str) -> Vec<&'a InventoryDiff> {
        report.diffs.iter().filter(|d| d.field_path == path).collect()
    }

    #[test]
    fn test_classifies_create_update_delete() {
        let prev = json!({"os": {"release": "8.9"}, "hardware": {"cpu": {"cores": 4}}, "custom": {"a": 1}});
        let curr = json!({"os": {"release": "9.3"}, "hardware": {"cpu": {"cores": 4}}, "custom": {"b": 2}});

        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));
        assert!(report.has_changes);
        assert_eq!(report.change_count, 3);

        let release = find(&report, "os.release")[0];
        assert_eq!(release.diff_type, DiffType::Update);
        assert_eq!(release.severity, Severity::High);
        assert_eq!(release.category, Category::Os);
        assert_eq!(release.previous_value, Some(json!("8.9")));
        assert_eq!(release.current_value, Some(json!("9.3")));
        assert_eq!(release.previous_id, Some(1));
        assert_eq!(release.current_id, 2);

        assert_eq!(find(&report, "custom.a")[0].diff_type, DiffType::Delete);
        assert_eq!(find(&report, "custom.b")[0].diff_type, DiffType::Create);
        assert_eq!(find(&report, "custom.b")[0].category, Category::System);
    }

    #[test]
    fn test_os_version_bump_is_single_update() {
        let prev = json!({"os": {"version": "9.2"}});
        let curr = json!({"os": {"version": "9.3"}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        let diff = &report.diffs[0];
        assert_eq!(diff.diff_type, DiffType::Update);
        assert_eq!(diff.category, Category::Os);
        assert_eq!(diff.field_path, "os.version");
        assert_eq!(diff.previous_value, Some(json!("9.2")));
        assert_eq!(diff.current_value, Some(json!("9.3")));
        assert_eq!(diff.severity, Severity::High);
    }

    #[test]
    fn test_new_hardware_field_is_single_create() {
        let prev = json!({});
        let curr = json!({"hardware": {"cpu_cores": 8}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        let diff = &report.diffs[0];
        assert_eq!(diff.diff_type, DiffType::Create);
        assert_eq!(diff.category, Category::Hardware);
        assert_eq!(diff.field_path, "hardware.cpu_cores");
        assert_eq!(diff.previous_value, None);
        assert_eq!(diff.current_value, Some(json!(8)));
    }

    #[test]
    fn test_empty_first_inventory_has_no_diffs() {
        let report = engine().compute("sys-1", None, (1, &json!({})));
        assert!(report.diffs.is_empty());
        assert!(!report.has_changes);

        // A root that changes shape reports its leaves only.
        let report = engine().compute("sys-1", Some((1, &json!({}))), (2, &json!([])));
        assert!(report.diffs.is_empty());
    }

    #[test]
    fn test_minor_metric_change_is_filtered() {
        let prev = json!({"hardware": {"cpu_usage_percent": 40.0, "load_average": 1.0}});
        let curr = json!({"hardware": {"cpu_usage_percent": 41.0, "load_average": 2.0}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].field_path, "hardware.load_average");
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let data = json!({"os": {"name": "rocky"}, "network": [{"ip": "10.0.0.1"}]});
        let report = engine().compute("sys-1", Some((1, &data)), (2, &data));
        assert!(!report.has_changes);
        assert!(report.diffs.is_empty());
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn test_first_inventory_creates_every_leaf() {
        let curr = json!({"fqdn": "a.example", "os": {"name": "rocky", "release": "9"}, "network": {"interfaces": [{"ip": "10.0.0.1"}]}});
        let report = engine().compute("sys-1", None, (7, &curr));

        assert_eq!(report.change_count, 4);
        assert!(report
            .diffs
            .iter()
            .all(|d| d.diff_type == DiffType::Create && d.previous_id.is_none()));
        assert_eq!(find(&report, "network.interfaces[0].ip").len(), 1);
        // Nothing at or above high among plain creates.
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn test_shape_change_is_delete_plus_create() {
        let prev = json!({"custom": {"owner": "ops"}});
        let curr = json!({"custom": {"owner": {"team": "ops", "site": "mi"}}});

        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));
        let types: Vec<(DiffType, &str)> = report
            .diffs
            .iter()
            .map(|d| (d.diff_type, d.field_path.as_str()))
            .collect();
        assert_eq!(types.len(), 3);
        assert_eq!(types[0], (DiffType::Delete, "custom.owner"));
        assert!(types.contains(&(DiffType::Create, "custom.owner.site")));
        assert!(types.contains(&(DiffType::Create, "custom.owner.team")));
        assert!(report.diffs.iter().all(|d| d.diff_type != DiffType::Update));
    }

    #[test]
    fn test_scalar_type_change_is_update() {
        let prev = json!({"custom": {"port": "22"}});
        let curr = json!({"custom": {"port": 22}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));
        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].diff_type, DiffType::Update);
    }

    #[test]
    fn test_array_length_changes() {
        let prev = json!({"services": ["sshd", "nginx"]});
        let curr = json!({"services": ["sshd"]});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        let diff = &report.diffs[0];
        assert_eq!(diff.field_path, "services[1]");
        assert_eq!(diff.diff_type, DiffType::Delete);
        assert_eq!(diff.category, Category::Services);
        assert_eq!(diff.severity, Severity::High);
    }

    #[test]
    fn test_depth_bound_reports_single_update() {
        let mut rules = DifferRules::default();
        rules.limits = DiffLimits {
            max_diff_depth: 2,
            ..DiffLimits::default()
        };
        let engine = DiffEngine::new(&rules).unwrap();

        let prev = json!({"custom": {"deep": {"a": {"b": 1}, "c": 1}}});
        let curr = json!({"custom": {"deep": {"a": {"b": 2}, "c": 2}}});
        let report = engine.compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].field_path, "custom.deep");
        assert_eq!(report.diffs[0].diff_type, DiffType::Update);
        assert_eq!(report.diffs[0].current_value, Some(json!({"a": {"b": 2}, "c": 2})));
    }

    #[test]
    fn test_insignificant_paths_are_dropped() {
        let prev = json!({"custom": {"uptime": 100, "owner": "a"}});
        let curr = json!({"custom": {"uptime": 200, "owner": "b"}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].field_path, "custom.owner");
    }

    #[test]
    fn test_diff_limit_truncates() {
        let mut rules = DifferRules::default();
        rules.limits.max_diffs_per_run = 3;
        let engine = DiffEngine::new(&rules).unwrap();

        let curr = json!({"custom": {"a": 1, "b": 2, "c": 3, "d": 4, "e": 5}});
        let report = engine.compute("sys-1", None, (1, &curr));
        assert_eq!(report.change_count, 3);
        assert!(report.truncated);
    }

    #[test]
    fn test_overlong_paths_are_skipped() {
        let mut rules = DifferRules::default();
        rules.limits.max_field_path_length = 10;
        let engine = DiffEngine::new(&rules).unwrap();

        let curr = json!({"custom": {"short": 1, "a_rather_long_key": 2}});
        let report = engine.compute("sys-1", None, (1, &curr));
        assert_eq!(report.diffs.len(), 0);

        let curr = json!({"fqdn": "x"});
        let report = engine.compute("sys-1", None, (1, &curr));
        assert_eq!(report.diffs.len(), 1);
    }

    #[test]
    fn test_change_alert_points_at_its_diff() {
        let prev = json!({"os": {"release": "8"}, "custom": {"x": 1}});
        let curr = json!({"os": {"release": "9"}, "custom": {"x": 2}});
        let report = engine().compute("sys-1", Some((1, &prev)), (2, &curr));

        assert_eq!(report.alerts.len(), 1);
        let alert = &report.alerts[0];
        assert_eq!(alert.alert_type, AlertType::Change);
        assert_eq!(alert.severity, Severity::High);
        let idx = alert.diff_index.unwrap();
        assert_eq!(report.diffs[idx].field_path, "os.release");
        assert_eq!(report.max_severity(), Some(Severity::High));
    }

    #[test]
    fn test_mass_change_raises_pattern_alert() {
        let mut rules = DifferRules::default();
        rules.alerts.mass_change_threshold = 3;
        let engine = DiffEngine::new(&rules).unwrap();

        let prev = json!({"custom": {"a": 1, "b": 1, "c": 1}});
        let curr = json!({"custom": {"a": 2, "b": 2, "c": 2}});
        let report = engine.compute("sys-1", Some((1, &prev)), (2, &curr));

        let patterns: Vec<_> = report
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::Pattern)
            .collect();
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].message.contains("system"));

        // A first inventory never raises pattern alerts.
        let first = engine.compute("sys-1", None, (1, &curr));
        assert!(first.alerts.iter().all(|a| a.alert_type != AlertType::Pattern));
    }
}
