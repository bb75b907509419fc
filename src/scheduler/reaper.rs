//! Background task returning ready retries to their queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::message::QueueKind;
use super::queue::QueueManager;

/// Periodically moves ready members of every delayed set back to the main
/// queue.
pub struct DelayedReaper {
    queue: Arc<QueueManager>,
    interval: Duration,
}

impl DelayedReaper {
    pub fn new(queue: Arc<QueueManager>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// One pass over all queues. Returns the number of messages moved.
    ///
    /// A failing queue is logged and skipped so the others still drain.
    pub async fn run_once(&self) -> usize {
        let mut moved = 0;
        for kind in QueueKind::ALL {
            match self.queue.process_delayed_messages(kind).await {
                Ok(n) => moved += n,
                Err(e) => {
                    warn!(queue = %kind, error = %e, "Failed to process delayed messages");
                }
            }
        }
        moved
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting delayed message reaper"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Delayed message reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let moved = self.run_once().await;
                    debug!(moved = moved, "Reaper pass complete");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{unix_now, QueueConfig, RequeueOutcome};
    use crate::store::{MemoryStore, QueueStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_run_once_moves_ready_messages() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(store.clone(), QueueConfig::default()));

        let msg = queue.enqueue_processing("sys-1", &json!({"record_id": 1})).await.unwrap();
        let popped = queue
            .dequeue_message(QueueKind::Processing, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id, msg.id);

        // Failed an hour ago, so the backoff has long elapsed.
        queue
            .requeue_message_at(QueueKind::Processing, popped, "boom", unix_now() - 3600.0)
            .await
            .unwrap();

        let reaper = DelayedReaper::new(queue.clone(), Duration::from_secs(30));
        assert_eq!(reaper.run_once().await, 1);
        assert_eq!(reaper.run_once().await, 0);

        let keys = queue.keys(QueueKind::Processing);
        assert_eq!(store.llen(&keys.main).await.unwrap(), 1);
        assert_eq!(store.zcard(&keys.delayed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_once_survives_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(store.clone(), QueueConfig::default()));
        store.set_unavailable(true);

        let reaper = DelayedReaper::new(queue, Duration::from_secs(30));
        assert_eq!(reaper.run_once().await, 0);
    }

    // Ready times are wall-clock scores, so this runs in real time.
    #[tokio::test]
    async fn test_running_reaper_returns_message_after_backoff() {
        let store = Arc::new(MemoryStore::new());
        let config = QueueConfig {
            retry_delay: Duration::from_millis(500),
            ..QueueConfig::default()
        };
        let queue = Arc::new(QueueManager::new(store.clone(), config));
        let interval = Duration::from_millis(200);

        queue.enqueue_processing("sys-1", &json!({"record_id": 1})).await.unwrap();
        let popped = queue
            .dequeue_message(QueueKind::Processing, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let outcome = queue
            .requeue_message(QueueKind::Processing, popped, "boom")
            .await
            .unwrap();
        let RequeueOutcome::Delayed { delay, .. } = outcome else {
            panic!("expected a delayed retry, got {:?}", outcome);
        };
        assert_eq!(delay, Duration::from_millis(500));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(DelayedReaper::new(queue.clone(), interval).run(rx));
        let keys = queue.keys(QueueKind::Processing);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.llen(&keys.main).await.unwrap(), 0);
        assert_eq!(store.zcard(&keys.delayed).await.unwrap(), 1);

        // Past the ready time by more than one reaper interval.
        time::sleep(delay + interval).await;
        assert_eq!(store.llen(&keys.main).await.unwrap(), 1);
        assert_eq!(store.zcard(&keys.delayed).await.unwrap(), 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(store, QueueConfig::default()));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(DelayedReaper::new(queue, Duration::from_secs(30)).run(rx));
        time::sleep(Duration::from_secs(65)).await;
        tx.send(()).unwrap();

        time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
