//! Queue health monitoring.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::queue::{Health, QueueError, QueueManager, QueueStats};
use crate::handlers::NotificationJob;
use crate::metrics::MetricsCollector;
use crate::storage::{Heartbeat, InventoryRepository, StatusChange, SystemStatus};

/// Result of one monitoring pass.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub stats: QueueStats,
    /// Systems silent for longer than the heartbeat timeout.
    pub stale_systems: Vec<Heartbeat>,
    /// Systems that went online or offline during this pass.
    pub status_changes: Vec<StatusChange>,
}

/// Publishes queue gauges, logs health transitions and, with a repository
/// attached, tracks which systems are online.
pub struct HealthMonitor {
    queue: Arc<QueueManager>,
    repository: Option<Arc<dyn InventoryRepository>>,
    interval: Duration,
    heartbeat_timeout: Duration,
    last_health: Health,
    metrics: MetricsCollector,
}

impl HealthMonitor {
    pub fn new(queue: Arc<QueueManager>, interval: Duration) -> Self {
        Self {
            queue,
            repository: None,
            interval,
            heartbeat_timeout: Duration::from_secs(600),
            last_health: Health::Healthy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Also reports systems whose heartbeat is older than `timeout` and
    /// notifies when a system goes offline or comes back.
    pub fn with_heartbeats(
        mut self,
        repository: Arc<dyn InventoryRepository>,
        timeout: Duration,
    ) -> Self {
        self.repository = Some(repository);
        self.heartbeat_timeout = timeout;
        self
    }

    /// Last health seen by [`check`](Self::check).
    pub fn last_health(&self) -> Health {
        self.last_health
    }

    /// Takes one snapshot of the queues and heartbeats.
    pub async fn check(&mut self) -> Result<HealthReport, QueueError> {
        let stats = self.queue.get_queue_stats().await?;
        self.metrics.update_queue_stats(&stats);

        if stats.queue_health != self.last_health {
            match stats.queue_health {
                Health::Critical => error!(
                    pending = stats.pending_jobs,
                    failed = stats.failed_jobs,
                    previous = %self.last_health,
                    "Queue health is critical"
                ),
                Health::Warning => warn!(
                    pending = stats.pending_jobs,
                    failed = stats.failed_jobs,
                    previous = %self.last_health,
                    "Queue health degraded"
                ),
                Health::Healthy => info!(previous = %self.last_health, "Queue health recovered"),
            }
            self.last_health = stats.queue_health;
        } else {
            debug!(
                pending = stats.pending_jobs,
                failed = stats.failed_jobs,
                health = %stats.queue_health,
                "Queue health check"
            );
        }

        let stale_systems = self.stale_systems().await;
        let status_changes = self.update_statuses().await;
        Ok(HealthReport {
            stats,
            stale_systems,
            status_changes,
        })
    }

    async fn update_statuses(&self) -> Vec<StatusChange> {
        let Some(repository) = &self.repository else {
            return Vec::new();
        };
        let Ok(timeout) = chrono::Duration::from_std(self.heartbeat_timeout) else {
            return Vec::new();
        };

        let changes = match repository.update_system_statuses(Utc::now() - timeout).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Failed to update system statuses");
                return Vec::new();
            }
        };

        for change in &changes {
            match change.status {
                SystemStatus::Offline => warn!(
                    system_id = %change.system_id,
                    last_heartbeat = %change.last_heartbeat,
                    "System went offline"
                ),
                _ => info!(system_id = %change.system_id, status = %change.status, "System is online"),
            }

            let job = NotificationJob::system_status(change);
            if let Err(e) = self.queue.enqueue_notification(&change.system_id, &job).await {
                error!(system_id = %change.system_id, error = %e, "Status notification not queued");
            }
        }
        changes
    }

    async fn stale_systems(&self) -> Vec<Heartbeat> {
        let Some(repository) = &self.repository else {
            return Vec::new();
        };
        let Ok(timeout) = chrono::Duration::from_std(self.heartbeat_timeout) else {
            return Vec::new();
        };

        match repository.stale_heartbeats(Utc::now() - timeout).await {
            Ok(stale) => {
                for heartbeat in &stale {
                    debug!(
                        system_id = %heartbeat.system_id,
                        last_heartbeat = %heartbeat.last_heartbeat,
                        "System heartbeat is stale"
                    );
                }
                stale
            }
            Err(e) => {
                warn!(error = %e, "Failed to read heartbeats");
                Vec::new()
            }
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting queue health monitor"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Queue health monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "Queue health check failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{QueueConfig, QueueKind};
    use crate::storage::MemoryRepository;
    use crate::store::{MemoryStore, QueueStore};
    use serde_json::json;

    fn queue() -> (Arc<MemoryStore>, Arc<QueueManager>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(store.clone(), QueueConfig::default()));
        (store, queue)
    }

    #[tokio::test]
    async fn test_tracks_health_transitions() {
        let (store, queue) = queue();
        let mut monitor = HealthMonitor::new(queue.clone(), Duration::from_secs(30));

        queue.enqueue_inventory("sys-1", &json!({})).await.unwrap();
        let report = monitor.check().await.unwrap();
        assert_eq!(report.stats.pending_jobs, 1);
        assert_eq!(monitor.last_health(), Health::Healthy);

        let dead = queue.keys(QueueKind::Notification).dead;
        for i in 0..11 {
            store.lpush(&dead, &format!("{{\"n\":{}}}", i)).await.unwrap();
        }
        let report = monitor.check().await.unwrap();
        assert_eq!(report.stats.failed_jobs, 11);
        assert_eq!(monitor.last_health(), Health::Warning);
    }

    #[tokio::test]
    async fn test_reports_stale_heartbeats() {
        let (_store, queue) = queue();
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_heartbeat("quiet", Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        repo.upsert_heartbeat("chatty", Utc::now()).await.unwrap();

        let mut monitor = HealthMonitor::new(queue, Duration::from_secs(30))
            .with_heartbeats(repo, Duration::from_secs(600));
        let report = monitor.check().await.unwrap();

        assert_eq!(report.stale_systems.len(), 1);
        assert_eq!(report.stale_systems[0].system_id, "quiet");
    }

    #[tokio::test]
    async fn test_status_changes_are_notified() {
        let (_store, queue) = queue();
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_heartbeat("sys-1", Utc::now()).await.unwrap();

        let mut monitor = HealthMonitor::new(queue.clone(), Duration::from_secs(30))
            .with_heartbeats(repo.clone(), Duration::from_secs(600));

        let report = monitor.check().await.unwrap();
        assert_eq!(report.status_changes.len(), 1);
        assert_eq!(report.status_changes[0].status, SystemStatus::Online);
        assert!(monitor.check().await.unwrap().status_changes.is_empty());

        repo.upsert_heartbeat("sys-1", Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        let report = monitor.check().await.unwrap();
        assert_eq!(report.status_changes[0].status, SystemStatus::Offline);
        assert_eq!(repo.system_status("sys-1"), SystemStatus::Offline);

        let mut kinds = Vec::new();
        while let Some(msg) = queue
            .dequeue_message(QueueKind::Notification, Duration::from_millis(10))
            .await
            .unwrap()
        {
            assert_eq!(msg.system_id, "sys-1");
            assert_eq!(msg.data["type"], "system_status");
            kinds.push(msg.data["severity"].as_str().unwrap_or_default().to_string());
        }
        kinds.sort();
        assert_eq!(kinds, vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn test_check_fails_when_store_is_down() {
        let (store, queue) = queue();
        store.set_unavailable(true);

        let mut monitor = HealthMonitor::new(queue, Duration::from_secs(30));
        assert!(monitor.check().await.is_err());
    }
}
