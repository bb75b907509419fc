//! Queue manager: typed enqueue, blocking dequeue, delayed retry and
//! dead-lettering on top of a [`QueueStore`].
//!
//! # Queue Structure
//!
//! Each [`QueueKind`] owns three keys:
//!
//! - `queue:{name}`: main list; producers LPUSH, workers BRPOP from the tail
//! - `queue:{name}:delayed`: sorted set of failed messages scored by the Unix
//!   time at which they become ready again
//! - `queue:{name}:dead`: list of messages that used up their attempts
//!
//! # Delivery
//!
//! Delivery is at-least-once. A message popped by a worker is gone from the
//! store until the handler fails and [`QueueManager::requeue_message`] puts it
//! into the delayed set or the dead-letter list. A worker that dies between
//! the pop and the requeue loses that message.
//!
//! The same holds for a blocking pop cut off by its deadline: if the store
//! already removed the entry but the reply arrives after the deadline, the
//! entry is gone. [`QueueManager::dequeue_message`] allows the pop its full
//! wait plus one `operation_timeout` before giving up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::message::{QueueKind, QueueMessage};
use crate::metrics::MetricsCollector;
use crate::store::{with_deadline, QueueStore, StoreError};

/// Pending messages (main + delayed) above which health is `warning`.
pub const WARNING_PENDING: u64 = 1_000;
/// Dead-lettered messages above which health is `warning`.
pub const WARNING_FAILED: u64 = 10;
/// Pending messages above which health is `critical`.
pub const CRITICAL_PENDING: u64 = 10_000;
/// Dead-lettered messages above which health is `critical`.
pub const CRITICAL_FAILED: u64 = 100;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The shared store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue's circuit breaker is open.
    #[error("Circuit breaker open for queue '{queue}', retry in {retry_after:?}")]
    CircuitOpen {
        queue: QueueKind,
        retry_after: Duration,
    },

    /// The main queue is deeper than the backpressure limit.
    #[error("Queue '{queue}' over backpressure limit ({depth} >= {limit})")]
    Backpressure {
        queue: QueueKind,
        depth: u64,
        limit: u64,
    },
}

impl QueueError {
    /// Returns true when the error means "try again later" rather than a
    /// broken store.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            QueueError::CircuitOpen { .. } | QueueError::Backpressure { .. }
        )
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Name of the inventory queue.
    pub inventory_queue: String,
    /// Name of the processing queue.
    pub processing_queue: String,
    /// Name of the notification queue.
    pub notification_queue: String,
    /// Attempts for inventory and processing messages.
    pub retry_attempts: u32,
    /// Attempts for notification messages.
    pub notification_retry_attempts: u32,
    /// Base delay multiplied by the attempt count.
    pub retry_delay: Duration,
    /// Ceiling on the retry delay.
    pub max_retry_delay: Duration,
    /// Delayed messages moved per reaper pass and queue.
    pub batch_size: usize,
    /// Nominal capacity of a main queue.
    pub max_queue_depth: u64,
    /// Fraction of `max_queue_depth` at which enqueues are rejected.
    pub backpressure_threshold: f64,
    /// Deadline for a single store operation.
    pub operation_timeout: Duration,
    /// Circuit breaker settings, applied per queue.
    pub breaker: CircuitBreakerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inventory_queue: "inventory".to_string(),
            processing_queue: "processing".to_string(),
            notification_queue: "notification".to_string(),
            retry_attempts: 3,
            notification_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            batch_size: 10,
            max_queue_depth: CRITICAL_PENDING,
            backpressure_threshold: 0.8,
            operation_timeout: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Depth of a main queue at which enqueues are rejected.
    pub fn backpressure_limit(&self) -> u64 {
        (self.max_queue_depth as f64 * self.backpressure_threshold).ceil() as u64
    }

    /// Linear backoff: `attempts * retry_delay`, capped at `max_retry_delay`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        self.retry_delay
            .saturating_mul(attempts)
            .min(self.max_retry_delay)
    }

    fn name(&self, kind: QueueKind) -> &str {
        match kind {
            QueueKind::Inventory => &self.inventory_queue,
            QueueKind::Processing => &self.processing_queue,
            QueueKind::Notification => &self.notification_queue,
        }
    }
}

/// Store keys for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Main list.
    pub main: String,
    /// Delayed sorted set.
    pub delayed: String,
    /// Dead-letter list.
    pub dead: String,
}

impl QueueKeys {
    fn for_name(name: &str) -> Self {
        Self {
            main: format!("queue:{}", name),
            delayed: format!("queue:{}:delayed", name),
            dead: format!("queue:{}:dead", name),
        }
    }
}

/// What happened to a message handed back after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// Scheduled for redelivery.
    Delayed {
        /// Backoff applied.
        delay: Duration,
        /// Unix time (seconds) at which the message becomes ready.
        ready_at: f64,
    },
    /// Moved to the dead-letter list.
    DeadLettered,
}

/// Overall queue health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Within normal limits.
    Healthy,
    /// Backlog or failures are building up.
    Warning,
    /// Operator attention required.
    Critical,
}

impl Health {
    /// Classifies pending and dead-lettered counts.
    pub fn classify(pending: u64, failed: u64) -> Self {
        if failed > CRITICAL_FAILED || pending > CRITICAL_PENDING {
            Health::Critical
        } else if failed > WARNING_FAILED || pending > WARNING_PENDING {
            Health::Warning
        } else {
            Health::Healthy
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Health::Healthy => "healthy",
            Health::Warning => "warning",
            Health::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Depths of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Queue kind.
    pub queue: QueueKind,
    /// Messages on the main list.
    pub main: u64,
    /// Messages waiting in the delayed set.
    pub delayed: u64,
    /// Messages in the dead-letter list.
    pub dead: u64,
}

/// Aggregated queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Main plus delayed messages across all queues.
    pub pending_jobs: u64,
    /// Dead-lettered messages across all queues.
    pub failed_jobs: u64,
    /// Per-queue breakdown.
    pub queues: Vec<QueueDepth>,
    /// Health classification.
    pub queue_health: Health,
}

struct Breakers {
    inventory: CircuitBreaker,
    processing: CircuitBreaker,
    notification: CircuitBreaker,
}

/// Typed access to the three pipeline queues.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    breakers: Breakers,
}

/// Current Unix time in fractional seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl QueueManager {
    /// Creates a queue manager on top of `store`.
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        let breakers = Breakers {
            inventory: CircuitBreaker::new(&config.inventory_queue, config.breaker.clone()),
            processing: CircuitBreaker::new(&config.processing_queue, config.breaker.clone()),
            notification: CircuitBreaker::new(&config.notification_queue, config.breaker.clone()),
        };
        Self {
            store,
            config,
            breakers,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Returns the store keys of a queue.
    pub fn keys(&self, kind: QueueKind) -> QueueKeys {
        QueueKeys::for_name(self.config.name(kind))
    }

    /// Returns the circuit breaker of a queue.
    pub fn breaker(&self, kind: QueueKind) -> &CircuitBreaker {
        match kind {
            QueueKind::Inventory => &self.breakers.inventory,
            QueueKind::Processing => &self.breakers.processing,
            QueueKind::Notification => &self.breakers.notification,
        }
    }

    fn max_attempts(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Notification => self.config.notification_retry_attempts,
            QueueKind::Inventory | QueueKind::Processing => self.config.retry_attempts,
        }
    }

    async fn admit(&self, kind: QueueKind, main_key: &str) -> Result<(), QueueError> {
        if let Err(retry_after) = self.breaker(kind).check() {
            MetricsCollector::new().record_enqueue_rejected(kind, "circuit_open");
            return Err(QueueError::CircuitOpen {
                queue: kind,
                retry_after,
            });
        }

        if self.config.max_queue_depth > 0 {
            let limit = self.config.backpressure_limit();
            let depth =
                with_deadline(self.config.operation_timeout, self.store.llen(main_key)).await?;
            if depth >= limit {
                warn!(queue = %kind, depth = depth, limit = limit, "Rejecting enqueue under backpressure");
                MetricsCollector::new().record_enqueue_rejected(kind, "backpressure");
                return Err(QueueError::Backpressure {
                    queue: kind,
                    depth,
                    limit,
                });
            }
        }

        Ok(())
    }

    async fn enqueue<T: Serialize + ?Sized>(
        &self,
        kind: QueueKind,
        system_id: &str,
        payload: &T,
    ) -> Result<QueueMessage, QueueError> {
        let keys = self.keys(kind);
        self.admit(kind, &keys.main).await?;

        let data = serde_json::to_value(payload)?;
        let msg = QueueMessage::new(kind, system_id, data, self.max_attempts(kind));
        let serialized = serde_json::to_string(&msg)?;

        // Single LPUSH: either the whole message lands or nothing does.
        with_deadline(
            self.config.operation_timeout,
            self.store.lpush(&keys.main, &serialized),
        )
        .await?;

        debug!(queue = %kind, message_id = %msg.id, system_id = %system_id, "Message enqueued");
        Ok(msg)
    }

    /// Enqueues a raw inventory snapshot.
    pub async fn enqueue_inventory<T: Serialize + ?Sized>(
        &self,
        system_id: &str,
        data: &T,
    ) -> Result<QueueMessage, QueueError> {
        self.enqueue(QueueKind::Inventory, system_id, data).await
    }

    /// Enqueues a change-detection job.
    pub async fn enqueue_processing<T: Serialize + ?Sized>(
        &self,
        system_id: &str,
        job: &T,
    ) -> Result<QueueMessage, QueueError> {
        self.enqueue(QueueKind::Processing, system_id, job).await
    }

    /// Enqueues a notification job.
    pub async fn enqueue_notification<T: Serialize + ?Sized>(
        &self,
        system_id: &str,
        job: &T,
    ) -> Result<QueueMessage, QueueError> {
        self.enqueue(QueueKind::Notification, system_id, job).await
    }

    /// Pops the next message, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. An entry that does not decode is moved
    /// verbatim to the dead-letter list and reported as `Ok(None)`.
    pub async fn dequeue_message(
        &self,
        kind: QueueKind,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let keys = self.keys(kind);
        // Full wait plus one operation timeout; see the module docs on late replies.
        let deadline = timeout + self.config.operation_timeout;

        let Some(raw) = with_deadline(deadline, self.store.brpop(&keys.main, timeout)).await?
        else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueMessage>(&raw) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                error!(queue = %kind, error = %e, "Undecodable message, moving to dead-letter list");
                with_deadline(
                    self.config.operation_timeout,
                    self.store.lpush(&keys.dead, &raw),
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Hands a failed message back for retry or dead-lettering.
    pub async fn requeue_message(
        &self,
        kind: QueueKind,
        msg: QueueMessage,
        err: &str,
    ) -> Result<RequeueOutcome, QueueError> {
        self.requeue_message_at(kind, msg, err, unix_now()).await
    }

    /// [`requeue_message`](Self::requeue_message) with an explicit clock.
    pub async fn requeue_message_at(
        &self,
        kind: QueueKind,
        mut msg: QueueMessage,
        err: &str,
        now: f64,
    ) -> Result<RequeueOutcome, QueueError> {
        let keys = self.keys(kind);
        self.breaker(kind).record_failure();
        msg.record_failure(err);

        if msg.is_exhausted() {
            let serialized = serde_json::to_string(&msg)?;
            with_deadline(
                self.config.operation_timeout,
                self.store.lpush(&keys.dead, &serialized),
            )
            .await?;

            error!(
                queue = %kind,
                message_id = %msg.id,
                system_id = %msg.system_id,
                attempts = msg.attempts,
                error = %err,
                "Message exhausted its attempts, moved to dead-letter list"
            );
            return Ok(RequeueOutcome::DeadLettered);
        }

        let delay = self.config.backoff_delay(msg.attempts);
        let ready_at = now + delay.as_secs_f64();
        let serialized = serde_json::to_string(&msg)?;
        with_deadline(
            self.config.operation_timeout,
            self.store.zadd(&keys.delayed, &serialized, ready_at),
        )
        .await?;

        warn!(
            queue = %kind,
            message_id = %msg.id,
            attempt = msg.attempts,
            remaining_attempts = msg.remaining_attempts(),
            delay_secs = delay.as_secs(),
            error = %err,
            "Message scheduled for retry"
        );
        Ok(RequeueOutcome::Delayed { delay, ready_at })
    }

    /// Moves ready delayed messages back onto the main queue.
    ///
    /// Returns the number of messages moved.
    pub async fn process_delayed_messages(&self, kind: QueueKind) -> Result<usize, QueueError> {
        self.process_delayed_messages_at(kind, unix_now()).await
    }

    /// [`process_delayed_messages`](Self::process_delayed_messages) with an
    /// explicit clock.
    pub async fn process_delayed_messages_at(
        &self,
        kind: QueueKind,
        now: f64,
    ) -> Result<usize, QueueError> {
        let keys = self.keys(kind);
        let ready = with_deadline(
            self.config.operation_timeout,
            self.store
                .zrange_ready(&keys.delayed, now, self.config.batch_size),
        )
        .await?;

        let mut moved = 0;
        for member in &ready {
            let was_moved = with_deadline(
                self.config.operation_timeout,
                self.store.move_delayed(&keys.delayed, &keys.main, member),
            )
            .await?;
            if was_moved {
                moved += 1;
            }
        }

        if moved > 0 {
            info!(queue = %kind, moved = moved, "Delayed messages returned to queue");
        }
        Ok(moved)
    }

    /// Reports a successful delivery to the queue's circuit breaker.
    pub fn record_success(&self, kind: QueueKind) {
        self.breaker(kind).record_success();
    }

    async fn depth(&self, kind: QueueKind) -> Result<QueueDepth, QueueError> {
        let keys = self.keys(kind);
        let timeout = self.config.operation_timeout;
        let (main, delayed, dead) = tokio::try_join!(
            with_deadline(timeout, self.store.llen(&keys.main)),
            with_deadline(timeout, self.store.zcard(&keys.delayed)),
            with_deadline(timeout, self.store.llen(&keys.dead)),
        )?;
        Ok(QueueDepth {
            queue: kind,
            main,
            delayed,
            dead,
        })
    }

    /// Aggregates queue depths into pending/failed counts and a health
    /// classification.
    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let (inventory, processing, notification) = tokio::try_join!(
            self.depth(QueueKind::Inventory),
            self.depth(QueueKind::Processing),
            self.depth(QueueKind::Notification),
        )?;
        let queues = vec![inventory, processing, notification];

        let pending_jobs = queues.iter().map(|q| q.main + q.delayed).sum();
        let failed_jobs = queues.iter().map(|q| q.dead).sum();

        Ok(QueueStats {
            pending_jobs,
            failed_jobs,
            queue_health: Health::classify(pending_jobs, failed_jobs),
            queues,
        })
    }

    /// Reads up to `limit` dead-lettered messages, newest first.
    ///
    /// Entries that never decoded are skipped.
    pub async fn peek_dead_letter(
        &self,
        kind: QueueKind,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(kind);
        let raw = with_deadline(
            self.config.operation_timeout,
            self.store.lrange(&keys.dead, 0, limit as isize - 1),
        )
        .await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }
}
