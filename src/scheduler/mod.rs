//! Queueing and background execution.
//!
//! This module provides the asynchronous half of the pipeline:
//!
//! - **QueueManager**: typed enqueue/dequeue over three store-backed queues,
//!   with delayed retries, dead-lettering, backpressure and per-queue
//!   circuit breakers
//! - **WorkerPool**: a pool of tokio tasks draining one queue through a
//!   [`JobHandler`]
//! - **DelayedReaper**, **HealthMonitor**, **RetentionSweeper**: periodic
//!   background tasks
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │     API      │
//!                      └──────┬───────┘
//!                             │ enqueue_inventory
//!                      ┌──────▼───────┐
//!                      │  inventory   │──► InventoryHandler ──┐
//!                      └──────────────┘                       │
//!                      ┌──────────────┐                       │
//!                      │  processing  │◄──────────────────────┘
//!                      └──────┬───────┘
//!                             ▼
//!                     ProcessingHandler ──► notification ──► NotificationHandler
//!
//!   failed message ──► queue:<name>:delayed ──(reaper)──► queue:<name>
//!                 └──► queue:<name>:dead   (attempts exhausted)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_collect::scheduler::{QueueConfig, QueueManager, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(QueueManager::new(store, QueueConfig::default()));
//! queue.enqueue_inventory("sys-1", &payload).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(5), queue.clone(), handler);
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

pub mod circuit_breaker;
pub mod message;
pub mod monitor;
pub mod queue;
pub mod reaper;
pub mod retention;
pub mod worker_pool;

// Re-export main types for convenience
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use message::{QueueKind, QueueMessage};
pub use monitor::{HealthMonitor, HealthReport};
pub use queue::{
    unix_now, Health, QueueConfig, QueueDepth, QueueError, QueueKeys, QueueManager, QueueStats,
    RequeueOutcome,
};
pub use reaper::DelayedReaper;
pub use retention::RetentionSweeper;
pub use worker_pool::{JobHandler, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
