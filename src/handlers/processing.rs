//! Change detection for stored snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{decode_payload, NotificationJob, NotificationKind, ProcessingJob};
use crate::differ::{DiffEngine, DiffReport, InventoryAlert};
use crate::error::HandlerError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{JobHandler, QueueKind, QueueManager, QueueMessage};
use crate::storage::{InventoryRepository, StoredDiffs};

/// Drains the processing queue.
///
/// Diffs of a record are replaced as a whole, so a redelivered job rewrites
/// the same rows instead of duplicating them.
pub struct ProcessingHandler {
    repository: Arc<dyn InventoryRepository>,
    queue: Arc<QueueManager>,
    engine: Arc<DiffEngine>,
    metrics: MetricsCollector,
}

impl ProcessingHandler {
    pub fn new(
        repository: Arc<dyn InventoryRepository>,
        queue: Arc<QueueManager>,
        engine: Arc<DiffEngine>,
    ) -> Self {
        Self {
            repository,
            queue,
            engine,
            metrics: MetricsCollector::new(),
        }
    }

    async fn notify_diffs(
        &self,
        system_id: &str,
        report: &DiffReport,
        stored: &StoredDiffs,
    ) -> Result<(), HandlerError> {
        let Some(severity) = report.max_severity() else {
            return Ok(());
        };

        let job = NotificationJob {
            kind: NotificationKind::Diff,
            system_id: system_id.to_string(),
            diff_ids: stored.diff_ids.clone(),
            diffs: report.diffs.clone(),
            alert: None,
            message: format!(
                "{} inventory change(s) detected on system {}",
                report.change_count, system_id
            ),
            severity,
            recipients: Vec::new(),
        };
        self.queue.enqueue_notification(system_id, &job).await?;
        Ok(())
    }

    async fn notify_alert(
        &self,
        system_id: &str,
        alert: &InventoryAlert,
        stored: &StoredDiffs,
    ) -> Result<(), HandlerError> {
        let mut alert = alert.clone();
        alert.diff_id = alert
            .diff_index
            .and_then(|index| stored.diff_ids.get(index).copied());

        let job = NotificationJob {
            kind: NotificationKind::Alert,
            system_id: system_id.to_string(),
            diff_ids: alert.diff_id.into_iter().collect(),
            diffs: Vec::new(),
            message: alert.message.clone(),
            severity: alert.severity,
            alert: Some(alert),
            recipients: Vec::new(),
        };
        self.queue.enqueue_notification(system_id, &job).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ProcessingHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Processing
    }

    async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError> {
        let job: ProcessingJob = decode_payload(&msg.data)?;

        let current = self
            .repository
            .get_record(job.record_id)
            .await?
            .ok_or(HandlerError::RecordNotFound(job.record_id))?;
        let previous = self.repository.previous_record(&current).await?;

        let report = self.engine.compute(
            &current.system_id,
            previous.as_ref().map(|p| (p.id, &p.data)),
            (current.id, &current.data),
        );
        let stored = self.repository.replace_diffs(current.id, &report).await?;
        self.metrics
            .record_diffs(report.diffs.iter().map(|d| &d.severity));

        if previous.is_some() && report.has_changes {
            self.notify_diffs(&current.system_id, &report, &stored)
                .await?;
        }
        for alert in &report.alerts {
            self.notify_alert(&current.system_id, alert, &stored).await?;
        }

        if report.has_changes {
            info!(
                system_id = %current.system_id,
                record_id = current.id,
                previous_id = ?previous.as_ref().map(|p| p.id),
                changes = report.change_count,
                alerts = report.alerts.len(),
                max_severity = ?report.max_severity(),
                "Inventory changes detected"
            );
        } else {
            debug!(system_id = %current.system_id, record_id = current.id, "No inventory changes");
        }
        Ok(())
    }
}
