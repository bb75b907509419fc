//! Stores raw inventory snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{decode_payload, InventorySubmission, ProcessingJob};
use crate::error::HandlerError;
use crate::scheduler::{JobHandler, QueueKind, QueueManager, QueueMessage};
use crate::storage::{InventoryRepository, NewInventoryRecord};

/// Drains the inventory queue.
///
/// Redelivery is harmless: an identical snapshot maps onto the row already
/// stored, so a retry after a failed enqueue schedules the same record.
pub struct InventoryHandler {
    repository: Arc<dyn InventoryRepository>,
    queue: Arc<QueueManager>,
}

impl InventoryHandler {
    pub fn new(repository: Arc<dyn InventoryRepository>, queue: Arc<QueueManager>) -> Self {
        Self { repository, queue }
    }
}

#[async_trait]
impl JobHandler for InventoryHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Inventory
    }

    async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError> {
        let submission: InventorySubmission = decode_payload(&msg.data)?;
        let record =
            NewInventoryRecord::from_payload(&msg.system_id, submission.timestamp, submission.data)?;

        let record_id = self.repository.insert_record(&record).await?;
        self.queue
            .enqueue_processing(&msg.system_id, &ProcessingJob { record_id })
            .await?;

        info!(
            system_id = %msg.system_id,
            record_id = record_id,
            data_size = record.data_size,
            "Inventory stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueConfig;
    use crate::storage::MemoryRepository;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn fixture() -> (Arc<MemoryRepository>, Arc<QueueManager>, InventoryHandler) {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(QueueManager::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
        ));
        let handler = InventoryHandler::new(repo.clone(), queue.clone());
        (repo, queue, handler)
    }

    fn message(data: serde_json::Value) -> QueueMessage {
        QueueMessage::new(QueueKind::Inventory, "sys-1", data, 3)
    }

    #[tokio::test]
    async fn test_stores_record_and_schedules_processing() {
        let (repo, queue, handler) = fixture();
        let submission = InventorySubmission {
            timestamp: Utc::now(),
            data: json!({"fqdn": "host.example.com"}),
        };

        handler
            .handle(&message(serde_json::to_value(&submission).unwrap()))
            .await
            .unwrap();

        let records = repo.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id, "sys-1");
        assert_eq!(records[0].data_hash.len(), 64);

        let job = queue
            .dequeue_message(QueueKind::Processing, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let job: ProcessingJob = serde_json::from_value(job.data).unwrap();
        assert_eq!(job.record_id, records[0].id);
    }

    #[tokio::test]
    async fn test_redelivery_reuses_record() {
        let (repo, _queue, handler) = fixture();
        let msg = message(
            serde_json::to_value(InventorySubmission {
                timestamp: Utc::now(),
                data: json!({"fqdn": "a"}),
            })
            .unwrap(),
        );

        handler.handle(&msg).await.unwrap();
        handler.handle(&msg).await.unwrap();
        assert_eq!(repo.records().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_payload() {
        let (repo, _queue, handler) = fixture();
        let err = handler
            .handle(&message(json!({"no_timestamp": true})))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::InvalidPayload(_)));
        assert!(repo.records().is_empty());
    }
}
