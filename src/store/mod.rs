//! Shared networked store used for queues and the credential cache.
//!
//! The pipeline only needs a handful of list, sorted-set and string
//! primitives. They are collected in the [`QueueStore`] trait so the queue
//! manager and the credential validator can run against Redis in production
//! and against [`MemoryStore`] in tests.
//!
//! # Key layout
//!
//! ```text
//! queue:<name>              list        main queue (LPUSH / BRPOP)
//! queue:<name>:delayed      sorted set  retries, scored by ready-at time
//! queue:<name>:dead         list        terminal dead-letter
//! auth:system:<key>:<hash>  string      cached auth verdict
//! ```

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors that can occur while talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The operation did not complete before its deadline.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Primitives the pipeline needs from the shared store.
///
/// Sorted-set scores are Unix timestamps in fractional seconds.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Pushes `value` onto the head of the list at `key`.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pops from the tail of the list at `key`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout expires with nothing to pop.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Adds `member` to the sorted set at `key` with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Returns up to `limit` members with a score of at most `max_score`,
    /// lowest score first.
    async fn zrange_ready(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically removes `member` from the sorted set `from` and pushes it
    /// onto the head of the list `to`.
    ///
    /// Returns `false` without touching `to` when `member` was no longer in
    /// `from`, which happens when a concurrent reaper already moved it.
    async fn move_delayed(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError>;

    /// Length of the list at `key` (0 when missing).
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// Cardinality of the sorted set at `key` (0 when missing).
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Runs a store operation under a deadline.
///
/// Dropping the inner future on expiry is safe for every [`QueueStore`]
/// operation: each is a single command, so it either ran or it did not.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}
