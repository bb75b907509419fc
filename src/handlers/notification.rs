//! Notification rendering and dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{decode_payload, NotificationJob, NotificationKind};
use crate::error::HandlerError;
use crate::scheduler::{JobHandler, QueueKind, QueueMessage};
use crate::storage::InventoryRepository;

/// Destination of rendered notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, job: &NotificationJob, rendered: &str) -> Result<(), HandlerError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, job: &NotificationJob, rendered: &str) -> Result<(), HandlerError> {
        info!(
            target: "fleet_collect::notifications",
            notification_type = job.kind.as_str(),
            system_id = %job.system_id,
            severity = %job.severity,
            recipients = job.recipients.len(),
            "{}",
            rendered
        );
        Ok(())
    }
}

/// Drains the notification queue.
pub struct NotificationHandler {
    repository: Arc<dyn InventoryRepository>,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationHandler {
    pub fn new(repository: Arc<dyn InventoryRepository>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { repository, sink }
    }
}

/// Renders the human-readable text of a notification.
pub fn render(job: &NotificationJob) -> Result<String, HandlerError> {
    match job.kind {
        NotificationKind::Diff => {
            if job.diffs.is_empty() && job.diff_ids.is_empty() {
                return Err(HandlerError::InvalidPayload(
                    "diff notification without diffs".to_string(),
                ));
            }

            let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
            for diff in &job.diffs {
                *by_category.entry(diff.category.as_str()).or_default() += 1;
            }
            let count = job.diffs.len().max(job.diff_ids.len());
            let breakdown = by_category
                .iter()
                .map(|(category, n)| format!("{}: {}", category, n))
                .collect::<Vec<_>>()
                .join(", ");

            if breakdown.is_empty() {
                Ok(format!(
                    "[{}] {} change(s) on system {}",
                    job.severity, count, job.system_id
                ))
            } else {
                Ok(format!(
                    "[{}] {} change(s) on system {} ({})",
                    job.severity, count, job.system_id, breakdown
                ))
            }
        }
        NotificationKind::Alert => {
            let alert = job.alert.as_ref().ok_or_else(|| {
                HandlerError::InvalidPayload("alert notification without alert".to_string())
            })?;
            Ok(format!(
                "[{}] {} alert on system {}: {}",
                alert.severity,
                alert.alert_type.as_str(),
                job.system_id,
                alert.message
            ))
        }
        NotificationKind::SystemStatus => Ok(format!(
            "[{}] system {}: {}",
            job.severity, job.system_id, job.message
        )),
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Notification
    }

    async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError> {
        let job: NotificationJob = decode_payload(&msg.data)?;
        let rendered = render(&job)?;

        self.sink.deliver(&job, &rendered).await?;

        if job.kind == NotificationKind::Diff && !job.diff_ids.is_empty() {
            let marked = self.repository.mark_notified(&job.diff_ids).await?;
            debug!(system_id = %job.system_id, marked = marked, "Diffs marked as notified");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::{
        AlertType, Category, DiffEngine, DiffType, DifferRules, InventoryAlert, InventoryDiff,
        Severity,
    };
    use crate::storage::{MemoryRepository, NewInventoryRecord};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, _job: &NotificationJob, rendered: &str) -> Result<(), HandlerError> {
            if self.fail {
                return Err(HandlerError::Delivery("smtp down".to_string()));
            }
            self.delivered.lock().unwrap().push(rendered.to_string());
            Ok(())
        }
    }

    fn diff(category: Category) -> InventoryDiff {
        InventoryDiff {
            system_id: "sys-1".to_string(),
            previous_id: Some(1),
            current_id: 2,
            diff_type: DiffType::Update,
            field_path: "os.release".to_string(),
            previous_value: Some(json!("8.1")),
            current_value: Some(json!("8.2")),
            severity: Severity::High,
            category,
            notification_sent: false,
        }
    }

    fn diff_job(diff_ids: Vec<i64>) -> NotificationJob {
        NotificationJob {
            kind: NotificationKind::Diff,
            system_id: "sys-1".to_string(),
            diff_ids,
            diffs: vec![diff(Category::Os), diff(Category::Os), diff(Category::Network)],
            alert: None,
            message: String::new(),
            severity: Severity::High,
            recipients: Vec::new(),
        }
    }

    fn message(job: &NotificationJob) -> QueueMessage {
        QueueMessage::new(
            QueueKind::Notification,
            "sys-1",
            serde_json::to_value(job).unwrap(),
            3,
        )
    }

    #[test]
    fn test_render_diff_groups_by_category() {
        let text = render(&diff_job(vec![])).unwrap();
        assert_eq!(text, "[high] 3 change(s) on system sys-1 (network: 1, os: 2)");
    }

    #[test]
    fn test_render_alert() {
        let job = NotificationJob {
            kind: NotificationKind::Alert,
            alert: Some(InventoryAlert {
                system_id: "sys-1".to_string(),
                diff_id: None,
                diff_index: None,
                alert_type: AlertType::Pattern,
                message: "30 hardware changes".to_string(),
                severity: Severity::High,
                is_resolved: false,
                resolved_at: None,
            }),
            diffs: Vec::new(),
            ..diff_job(vec![])
        };
        assert_eq!(
            render(&job).unwrap(),
            "[high] pattern alert on system sys-1: 30 hardware changes"
        );

        let missing = NotificationJob { alert: None, ..job };
        assert!(matches!(render(&missing), Err(HandlerError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_delivers_then_marks_diffs() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = DiffEngine::new(&DifferRules::default()).unwrap();
        let record = NewInventoryRecord::from_payload("sys-1", Utc::now(), json!({"fqdn": "a"}))
            .unwrap();
        let id = repo.insert_record(&record).await.unwrap();
        let report = engine.compute("sys-1", None, (id, &record.data));
        let stored = repo.replace_diffs(id, &report).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = NotificationHandler::new(repo.clone(), sink.clone());
        handler
            .handle(&message(&diff_job(stored.diff_ids.clone())))
            .await
            .unwrap();

        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert!(repo.diffs().iter().all(|d| d.diff.notification_sent));
    }

    #[tokio::test]
    async fn test_failed_delivery_leaves_diffs_unmarked() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = DiffEngine::new(&DifferRules::default()).unwrap();
        let record = NewInventoryRecord::from_payload("sys-1", Utc::now(), json!({"fqdn": "a"}))
            .unwrap();
        let id = repo.insert_record(&record).await.unwrap();
        let stored = repo
            .replace_diffs(id, &engine.compute("sys-1", None, (id, &record.data)))
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let handler = NotificationHandler::new(repo.clone(), sink);
        let err = handler
            .handle(&message(&diff_job(stored.diff_ids)))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Delivery(_)));
        assert!(repo.diffs().iter().all(|d| !d.diff.notification_sent));
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        let job = diff_job(vec![1]);
        LogSink.deliver(&job, "rendered").await.unwrap();
    }
}
