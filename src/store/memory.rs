//! In-process [`QueueStore`] for tests and local development.
//!
//! Expiry and blocking pops use `tokio::time`, so tests that pause the clock
//! see TTLs and timeouts advance deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{QueueStore, StoreError};

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    strings: HashMap<String, (String, Instant)>,
}

impl Inner {
    fn zset_insert(&mut self, key: &str, member: &str, score: f64) {
        let set = self.zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let pos = set
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member))
            .unwrap_or(set.len());
        set.insert(pos, (score, member.to_string()));
    }

    fn zset_remove(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.zsets.get_mut(key) else {
            return false;
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        set.len() != before
    }
}

/// Shared store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with `StoreError::Unavailable`
    /// until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Returns the score of `member` in the sorted set at `key`.
    pub async fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        let inner = self.inner.lock().await;
        inner
            .zsets
            .get(key)?
            .iter()
            .find(|(_, m)| m == member)
            .map(|(s, _)| *s)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.check()?;

            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self
                .inner
                .lock()
                .await
                .lists
                .get_mut(key)
                .and_then(VecDeque::pop_back)
            {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().await.zset_insert(key, member, score);
        Ok(())
    }

    async fn zrange_ready(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .take_while(|(score, _)| *score <= max_score)
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn move_delayed(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if !inner.zset_remove(from, member) {
            return Ok(false);
        }
        inner
            .lists
            .entry(to.to_string())
            .or_default()
            .push_front(member.to_string());
        drop(inner);
        self.pushed.notify_waiters();
        Ok(true)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner.zsets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().await;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as isize;
        let resolve = |i: isize| if i < 0 { len + i } else { i };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        match inner.strings.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                inner.strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .strings
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_is_fifo_between_lpush_and_brpop() {
        let store = MemoryStore::new();
        store.lpush("q", "a").await.unwrap();
        store.lpush("q", "b").await.unwrap();

        let first = store.brpop("q", Duration::from_secs(1)).await.unwrap();
        let second = store.brpop("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_brpop_times_out_with_none() {
        let store = MemoryStore::new();
        let popped = store.brpop("q", Duration::from_secs(2)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_brpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.brpop("q", Duration::from_secs(10)).await })
        };

        tokio::task::yield_now().await;
        store.lpush("q", "late").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_zrange_ready_orders_by_score_and_limits() {
        let store = MemoryStore::new();
        store.zadd("d", "late", 30.0).await.unwrap();
        store.zadd("d", "early", 10.0).await.unwrap();
        store.zadd("d", "mid", 20.0).await.unwrap();

        let ready = store.zrange_ready("d", 25.0, 10).await.unwrap();
        assert_eq!(ready, vec!["early".to_string(), "mid".to_string()]);

        let limited = store.zrange_ready("d", 100.0, 1).await.unwrap();
        assert_eq!(limited, vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn test_zadd_updates_existing_member_score() {
        let store = MemoryStore::new();
        store.zadd("d", "m", 10.0).await.unwrap();
        store.zadd("d", "m", 50.0).await.unwrap();

        assert_eq!(store.zcard("d").await.unwrap(), 1);
        assert_eq!(store.zscore("d", "m").await, Some(50.0));
    }

    #[tokio::test]
    async fn test_move_delayed_only_once() {
        let store = MemoryStore::new();
        store.zadd("d", "m", 1.0).await.unwrap();

        assert!(store.move_delayed("d", "q", "m").await.unwrap());
        assert!(!store.move_delayed("d", "q", "m").await.unwrap());
        assert_eq!(store.llen("q").await.unwrap(), 1);
        assert_eq!(store.zcard("d").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lrange_handles_negative_indices() {
        let store = MemoryStore::new();
        for v in ["c", "b", "a"] {
            store.lpush("l", v).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.lpush("q", "v").await.is_err());

        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
