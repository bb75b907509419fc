//! Per-queue circuit breaker guarding enqueues.
//!
//! Handler failures reported through the queue manager are counted in a
//! rolling window. When the count reaches the threshold the breaker opens and
//! new enqueues for that queue are rejected, so a downstream outage cannot
//! grow the delayed and dead-letter structures without bound.
//!
//! States:
//! - Closed: enqueues go through
//! - Open: enqueues are rejected until `open_timeout` elapses
//! - HalfOpen: enqueues go through; `success_threshold` successes close the
//!   breaker, a single failure reopens it

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the breaker.
    pub failure_threshold: u32,
    /// Length of the rolling failure window.
    pub failure_window: Duration,
    /// How long the breaker stays open before admitting traffic again.
    pub open_timeout: Duration,
    /// Successes needed in half-open state to close the breaker.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Rejecting enqueues.
    Open,
    /// Probing whether the downstream recovered.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// Rolling-window circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_of(&self, inner: &Inner, now: Instant) -> BreakerState {
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(opened) if now.duration_since(opened) >= self.config.open_timeout => {
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        self.state_of(&inner, Instant::now())
    }

    /// Checks whether an enqueue may proceed.
    ///
    /// Returns the remaining open time when the breaker rejects.
    pub fn check(&self) -> Result<(), Duration> {
        let inner = self.lock();
        let now = Instant::now();
        match (self.state_of(&inner, now), inner.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                let remaining = self
                    .config
                    .open_timeout
                    .saturating_sub(now.duration_since(opened));
                Err(remaining)
            }
            _ => Ok(()),
        }
    }

    /// Records a successful delivery.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match self.state_of(&inner, Instant::now()) {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.opened_at = None;
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    info!(queue = %self.name, "Circuit breaker closed, queue recovered");
                }
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    /// Records a failed delivery.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();

        match self.state_of(&inner, now) {
            BreakerState::HalfOpen => {
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
                warn!(queue = %self.name, "Circuit breaker reopened during recovery probe");
                return;
            }
            BreakerState::Open => return,
            BreakerState::Closed => {}
        }

        inner.failures.push_back(now);
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        let failures = inner.failures.len() as u32;
        if failures >= self.config.failure_threshold {
            inner.opened_at = Some(now);
            inner.half_open_successes = 0;
            inner.failures.clear();
            error!(
                queue = %self.name,
                failures = failures,
                threshold = self.config.failure_threshold,
                open_timeout_secs = self.config.open_timeout.as_secs(),
                "Circuit breaker opened, rejecting enqueues"
            );
        }
    }

    /// Failures currently inside the rolling window.
    pub fn recent_failures(&self) -> usize {
        self.lock().failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                failure_window: Duration::from_secs(60),
                open_timeout: Duration::from_secs(30),
                success_threshold: 2,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.check(), Err(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_failure();

        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.recent_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closes_after_successes() {
        let cb = breaker(1);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.check().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_is_noop() {
        let cb = breaker(2);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.recent_failures(), 1);
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
