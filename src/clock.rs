//! Time source shared by the cache, limiters, quota and decision engine.
//!
//! Everything that reads "now" or sleeps goes through [`Clock`] so tests can
//! drive time with [`ManualClock`] instead of waiting on the wall clock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by chrono and tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests and replay.
///
/// `sleep` never blocks: it records the requested duration, advances time by
/// that amount and yields to the scheduler.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration.as_millis() as i64);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_millis(250)).await;
        clock.advance(50);
        assert_eq!(clock.now_ms(), 1_300);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(250)]);
    }
}
