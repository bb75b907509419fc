//! In-process repository for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CredentialStore, DatabaseError, Heartbeat, InventoryRecord, InventoryRepository,
    NewInventoryRecord, RetentionPolicy, RetentionReport, StatusChange, StoredDiffs,
    SystemCredentials, SystemStatus,
};
use crate::differ::{DiffReport, InventoryAlert, InventoryDiff, Severity};

/// A diff as held by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDiff {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub diff: InventoryDiff,
}

/// An alert as held by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAlert {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub alert: InventoryAlert,
}

#[derive(Default)]
struct State {
    systems: HashMap<String, SystemCredentials>,
    records: Vec<InventoryRecord>,
    diffs: Vec<StoredDiff>,
    alerts: Vec<StoredAlert>,
    heartbeats: HashMap<String, Heartbeat>,
    statuses: HashMap<String, SystemStatus>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Repository held entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    credential_lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("memory repository offline".to_string()));
        }
        Ok(())
    }

    /// Makes every operation fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Registers a system.
    pub fn add_system(&self, credentials: SystemCredentials) {
        self.lock()
            .systems
            .insert(credentials.system_key.clone(), credentials);
    }

    /// Returns the stored credentials of `system_key`.
    pub fn system(&self, system_key: &str) -> Option<SystemCredentials> {
        self.lock().systems.get(system_key).cloned()
    }

    /// Number of `find_by_key` calls so far.
    pub fn credential_lookups(&self) -> usize {
        self.credential_lookups.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<InventoryRecord> {
        self.lock().records.clone()
    }

    pub fn diffs(&self) -> Vec<StoredDiff> {
        self.lock().diffs.clone()
    }

    pub fn alerts(&self) -> Vec<StoredAlert> {
        self.lock().alerts.clone()
    }

    /// Overrides the creation time of stored rows, for retention tests.
    pub fn backdate(&self, record_id: i64, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) {
            record.timestamp = at;
        }
        for diff in state.diffs.iter_mut().filter(|d| d.diff.current_id == record_id) {
            diff.created_at = at;
        }
    }

    /// Marks an alert resolved at `at`.
    pub fn resolve_alert(&self, alert_id: i64, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(stored) = state.alerts.iter_mut().find(|a| a.id == alert_id) {
            stored.alert.is_resolved = true;
            stored.alert.resolved_at = Some(at);
        }
    }

    /// Status last assigned by [`update_system_statuses`](InventoryRepository::update_system_statuses).
    pub fn system_status(&self, system_id: &str) -> SystemStatus {
        self.lock()
            .statuses
            .get(system_id)
            .copied()
            .unwrap_or(SystemStatus::Unknown)
    }
}

#[async_trait]
impl CredentialStore for MemoryRepository {
    async fn find_by_key(
        &self,
        system_key: &str,
    ) -> Result<Option<SystemCredentials>, DatabaseError> {
        self.credential_lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.lock().systems.get(system_key).cloned())
    }

    async fn mark_used(&self, system_id: &str) -> Result<(), DatabaseError> {
        self.check()?;
        let mut state = self.lock();
        if let Some(creds) = state.systems.values_mut().find(|c| c.system_id == system_id) {
            creds.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository for MemoryRepository {
    async fn insert_record(&self, record: &NewInventoryRecord) -> Result<i64, DatabaseError> {
        self.check()?;
        let mut state = self.lock();

        if let Some(existing) = state
            .records
            .iter_mut()
            .find(|r| r.system_id == record.system_id && r.data_hash == record.data_hash)
        {
            existing.timestamp = record.timestamp;
            return Ok(existing.id);
        }

        let id = state.next_id();
        state.records.push(InventoryRecord {
            id,
            system_id: record.system_id.clone(),
            timestamp: record.timestamp,
            data: record.data.clone(),
            data_hash: record.data_hash.clone(),
            data_size: record.data_size,
            processed_at: None,
            has_changes: false,
            change_count: 0,
        });
        Ok(id)
    }

    async fn get_record(&self, id: i64) -> Result<Option<InventoryRecord>, DatabaseError> {
        self.check()?;
        Ok(self.lock().records.iter().find(|r| r.id == id).cloned())
    }

    async fn previous_record(
        &self,
        current: &InventoryRecord,
    ) -> Result<Option<InventoryRecord>, DatabaseError> {
        self.check()?;
        let state = self.lock();
        Ok(state
            .records
            .iter()
            .filter(|r| r.system_id == current.system_id && r.id != current.id)
            .filter(|r| (r.timestamp, r.id) < (current.timestamp, current.id))
            .max_by_key(|r| (r.timestamp, r.id))
            .cloned())
    }

    async fn replace_diffs(
        &self,
        current_id: i64,
        report: &DiffReport,
    ) -> Result<StoredDiffs, DatabaseError> {
        self.check()?;
        let mut state = self.lock();
        if !state.records.iter().any(|r| r.id == current_id) {
            return Err(DatabaseError::NotFound(format!(
                "inventory record {}",
                current_id
            )));
        }

        let old: Vec<i64> = state
            .diffs
            .iter()
            .filter(|d| d.diff.current_id == current_id)
            .map(|d| d.id)
            .collect();
        state
            .alerts
            .retain(|a| a.alert.diff_id.map_or(true, |id| !old.contains(&id)));
        state.diffs.retain(|d| d.diff.current_id != current_id);

        let now = Utc::now();
        let mut stored = StoredDiffs::default();
        for diff in &report.diffs {
            let id = state.next_id();
            let mut diff = diff.clone();
            diff.current_id = current_id;
            state.diffs.push(StoredDiff {
                id,
                created_at: now,
                diff,
            });
            stored.diff_ids.push(id);
        }
        for alert in &report.alerts {
            let id = state.next_id();
            let mut alert = alert.clone();
            alert.diff_id = alert.diff_index.and_then(|i| stored.diff_ids.get(i).copied());
            state.alerts.push(StoredAlert {
                id,
                created_at: now,
                alert,
            });
            stored.alert_ids.push(id);
        }

        if let Some(record) = state.records.iter_mut().find(|r| r.id == current_id) {
            record.processed_at = Some(now);
            record.has_changes = report.has_changes;
            record.change_count = report.change_count as i32;
        }
        Ok(stored)
    }

    async fn mark_notified(&self, diff_ids: &[i64]) -> Result<u64, DatabaseError> {
        self.check()?;
        let mut state = self.lock();
        let mut changed = 0;
        for stored in state.diffs.iter_mut() {
            if diff_ids.contains(&stored.id) && !stored.diff.notification_sent {
                stored.diff.notification_sent = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn upsert_heartbeat(
        &self,
        system_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Heartbeat, DatabaseError> {
        self.check()?;
        let heartbeat = Heartbeat {
            system_id: system_id.to_string(),
            last_heartbeat: at,
        };
        self.lock()
            .heartbeats
            .insert(system_id.to_string(), heartbeat.clone());
        Ok(heartbeat)
    }

    async fn stale_heartbeats(&self, before: DateTime<Utc>) -> Result<Vec<Heartbeat>, DatabaseError> {
        self.check()?;
        let mut stale: Vec<Heartbeat> = self
            .lock()
            .heartbeats
            .values()
            .filter(|h| h.last_heartbeat < before)
            .cloned()
            .collect();
        stale.sort_by_key(|h| h.last_heartbeat);
        Ok(stale)
    }

    async fn update_system_statuses(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StatusChange>, DatabaseError> {
        self.check()?;
        let mut state = self.lock();
        let State {
            heartbeats,
            statuses,
            ..
        } = &mut *state;

        let mut changes = Vec::new();
        for heartbeat in heartbeats.values() {
            let status = statuses
                .entry(heartbeat.system_id.clone())
                .or_insert(SystemStatus::Unknown);
            let next = if heartbeat.last_heartbeat > cutoff {
                SystemStatus::Online
            } else if *status == SystemStatus::Online {
                SystemStatus::Offline
            } else {
                continue;
            };
            if next != *status {
                *status = next;
                changes.push(StatusChange {
                    system_id: heartbeat.system_id.clone(),
                    status: next,
                    last_heartbeat: heartbeat.last_heartbeat,
                });
            }
        }
        changes.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        Ok(changes)
    }

    async fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, DatabaseError> {
        self.check()?;
        let cutoff = now - policy.max_age;
        let important_cutoff = now - policy.max_age * policy.important_diff_factor;
        let mut state = self.lock();

        let mut keep: Vec<i64> = Vec::new();
        let mut by_system: HashMap<&str, Vec<&InventoryRecord>> = HashMap::new();
        for record in &state.records {
            by_system.entry(&record.system_id).or_default().push(record);
        }
        for records in by_system.values_mut() {
            records.sort_by_key(|r| std::cmp::Reverse((r.timestamp, r.id)));
            keep.extend(
                records
                    .iter()
                    .take(policy.keep_latest.max(0) as usize)
                    .map(|r| r.id),
            );
        }

        let before = state.records.len();
        state
            .records
            .retain(|r| r.timestamp >= cutoff || keep.contains(&r.id));
        let records = (before - state.records.len()) as u64;

        let before = state.diffs.len();
        state.diffs.retain(|d| {
            let limit = if d.diff.severity >= Severity::High {
                important_cutoff
            } else {
                cutoff
            };
            d.created_at >= limit
        });
        let diffs = (before - state.diffs.len()) as u64;

        let before = state.alerts.len();
        state.alerts.retain(|a| {
            !(a.alert.is_resolved && a.alert.resolved_at.map_or(false, |at| at < cutoff))
        });
        let alerts = (before - state.alerts.len()) as u64;

        Ok(RetentionReport {
            records,
            diffs,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(system_id: &str, data: serde_json::Value, at: DateTime<Utc>) -> NewInventoryRecord {
        NewInventoryRecord::from_payload(system_id, at, data).unwrap()
    }

    #[tokio::test]
    async fn test_status_transitions_follow_heartbeats() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(10);
        repo.upsert_heartbeat("fresh", now).await.unwrap();
        repo.upsert_heartbeat("silent", now - chrono::Duration::hours(1)).await.unwrap();

        // A system never seen online does not go offline.
        let changes = repo.update_system_statuses(cutoff).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].system_id, "fresh");
        assert_eq!(changes[0].status, SystemStatus::Online);
        assert_eq!(repo.system_status("silent"), SystemStatus::Unknown);
        assert!(repo.update_system_statuses(cutoff).await.unwrap().is_empty());

        let later = cutoff + chrono::Duration::hours(1);
        let changes = repo.update_system_statuses(later).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, SystemStatus::Offline);
        assert_eq!(repo.system_status("fresh"), SystemStatus::Offline);

        repo.upsert_heartbeat("fresh", later + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let changes = repo.update_system_statuses(later).await.unwrap();
        assert_eq!(changes[0].status, SystemStatus::Online);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_hash() {
        let repo = MemoryRepository::new();
        let t0 = Utc::now();
        let a = repo.insert_record(&record("s", json!({"v": 1}), t0)).await.unwrap();
        let b = repo
            .insert_record(&record("s", json!({"v": 1}), t0 + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        let other_system = repo.insert_record(&record("t", json!({"v": 1}), t0)).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other_system);
        let stored = repo.get_record(a).await.unwrap().unwrap();
        assert_eq!(stored.timestamp, t0 + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_previous_record_by_timestamp() {
        let repo = MemoryRepository::new();
        let t0 = Utc::now();
        let first = repo.insert_record(&record("s", json!({"v": 1}), t0)).await.unwrap();
        let second = repo
            .insert_record(&record("s", json!({"v": 2}), t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        repo.insert_record(&record("other", json!({"v": 3}), t0)).await.unwrap();

        let current = repo.get_record(second).await.unwrap().unwrap();
        let previous = repo.previous_record(&current).await.unwrap().unwrap();
        assert_eq!(previous.id, first);

        let first = repo.get_record(first).await.unwrap().unwrap();
        assert!(repo.previous_record(&first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_and_lookup_counter() {
        let repo = MemoryRepository::new();
        repo.set_unavailable(true);
        assert!(matches!(
            repo.find_by_key("k").await,
            Err(DatabaseError::Unavailable(_))
        ));
        assert_eq!(repo.credential_lookups(), 1);
    }
}
