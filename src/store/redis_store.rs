//! Redis implementation of [`QueueStore`].
//!
//! Ordinary commands share one [`ConnectionManager`], which reconnects on its
//! own. Blocking pops would stall every other command multiplexed on that
//! connection, so BRPOP runs on a small pool of dedicated connections.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, IntoConnectionInfo, Script};
use tokio::sync::Mutex;
use tracing::debug;

use super::{QueueStore, StoreError};

/// Removes a member from a delayed set and pushes it onto a list, but only
/// when this caller was the one that removed it.
const MOVE_DELAYED_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Redis-backed store.
pub struct RedisStore {
    client: redis::Client,
    redis: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    move_script: Script,
}

impl RedisStore {
    /// Connects to Redis and selects logical database `db`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str, db: i64) -> Result<Self, StoreError> {
        let mut info = redis_url
            .into_connection_info()
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        info.redis.db = db;

        let client =
            redis::Client::open(info).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            move_script: Script::new(MOVE_DELAYED_SCRIPT),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!("Opening dedicated connection for blocking pop");
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        Ok(conn)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        // A zero timeout blocks forever in Redis.
        let timeout_secs = timeout.as_secs().max(1);

        let result: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(popped) => {
                self.checkin_blocking(conn).await;
                Ok(popped.map(|(_, value)| value))
            }
            // Drop the connection on error; it may be in an unknown state.
            Err(e) => Err(e.into()),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrange_ready(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, "-inf", max_score, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn move_delayed(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .move_script
            .key(from)
            .key(to)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.zcard(key).await?;
        Ok(len)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let items: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(items)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
