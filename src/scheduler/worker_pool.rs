//! Worker pool consuming one pipeline queue.
//!
//! Each worker runs as an independent async task that pops messages from its
//! queue and hands them to the queue's [`JobHandler`]. Workers share nothing
//! in-process except statistics counters; all queue state lives in the store.
//!
//! # Features
//!
//! - Configurable number of workers per queue
//! - Graceful shutdown with broadcast channel
//! - Handler errors, timeouts and panics all become a requeue
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::message::{QueueKind, QueueMessage};
use super::queue::{QueueManager, RequeueOutcome};
use crate::error::HandlerError;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Processes messages of one queue kind.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the
/// same message more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue this handler consumes.
    fn kind(&self) -> QueueKind;

    /// Handles one message. An error sends the message back for retry.
    async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError>;
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue blocks before the worker rechecks for shutdown.
    pub poll_timeout: Duration,
    /// Maximum time allowed for handling a single message.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_timeout: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with `num_workers` workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently handling a message.
    pub active_workers: usize,
    /// Messages handled successfully.
    pub jobs_completed: u64,
    /// Messages whose handler failed.
    pub jobs_failed: u64,
    /// Average handling duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of messages handled (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Pool of workers consuming one queue.
pub struct WorkerPool {
    kind: QueueKind,
    config: WorkerPoolConfig,
    queue: Arc<QueueManager>,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a stopped worker pool for the handler's queue.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<QueueManager>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            kind: handler.kind(),
            config,
            queue,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-worker-{}", self.kind, i),
                kind: self.kind,
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_timeout: self.config.poll_timeout,
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %self.kind,
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight handlers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.kind, "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(queue = %self.kind, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the queue consumed by this pool.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }
}

/// A single worker task.
struct Worker {
    id: String,
    kind: QueueKind,
    queue: Arc<QueueManager>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_timeout: Duration,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// The shutdown signal is only checked between dequeues, so a popped
    /// message is always handled or requeued before the worker exits.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue_message(self.kind, self.poll_timeout).await {
                Ok(Some(msg)) => self.process_message(msg).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No messages available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue message");
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_message(&self, msg: QueueMessage) {
        let start_time = Instant::now();
        debug!(
            worker_id = %self.id,
            message_id = %msg.id,
            system_id = %msg.system_id,
            attempt = msg.attempts + 1,
            "Handling message"
        );

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
        let result = self.execute_with_timeout(&msg).await;
        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);
        let duration = start_time.elapsed();

        match result {
            Ok(()) => {
                self.stats.record_completion(duration);
                self.metrics.record_job(self.kind, "success", duration);
                self.queue.record_success(self.kind);
                debug!(
                    worker_id = %self.id,
                    message_id = %msg.id,
                    duration_ms = duration.as_millis() as u64,
                    "Message handled"
                );
            }
            Err(reason) => {
                self.stats.record_failure(duration);
                self.metrics.record_job(self.kind, "failure", duration);
                let message_id = msg.id;

                match self.queue.requeue_message(self.kind, msg, &reason).await {
                    Ok(RequeueOutcome::DeadLettered) => {
                        self.metrics.record_dead_letter(self.kind);
                    }
                    Ok(RequeueOutcome::Delayed { .. }) => {}
                    Err(e) => {
                        // The message is lost at this point; make it loud.
                        error!(
                            worker_id = %self.id,
                            message_id = %message_id,
                            handler_error = %reason,
                            error = %e,
                            "Failed to requeue message"
                        );
                    }
                }
            }
        }
    }

    /// Runs the handler, turning errors, panics and timeouts into a reason
    /// string for the requeue.
    async fn execute_with_timeout(&self, msg: &QueueMessage) -> Result<(), String> {
        let fut = AssertUnwindSafe(self.handler.handle(msg)).catch_unwind();

        match tokio::time::timeout(self.job_timeout, fut).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                warn!(worker_id = %self.id, message_id = %msg.id, error = %e, "Handler failed");
                Err(e.to_string())
            }
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker_id = %self.id, message_id = %msg.id, panic = %detail, "Handler panicked");
                Err(format!("handler panicked: {}", detail))
            }
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    message_id = %msg.id,
                    timeout_secs = self.job_timeout.as_secs(),
                    "Handler timed out"
                );
                Err(format!("handler timed out after {:?}", self.job_timeout))
            }
        }
    }
}
