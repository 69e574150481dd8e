//! Outbound sliding-window limiter, one instance per provider

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::utils::SlidingWindow;

pub struct UpstreamRateLimiter {
    provider: String,
    window: Mutex<SlidingWindow>,
    clock: Arc<dyn Clock>,
}

impl UpstreamRateLimiter {
    pub fn new(
        provider: impl Into<String>,
        max_requests: usize,
        window_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider: provider.into(),
            window: Mutex::new(SlidingWindow::new(window_ms, max_requests)),
            clock,
        }
    }

    /// Wait until a slot is free, then claim it.
    /// Sleeps until the oldest admitted request leaves the window instead of polling.
    pub async fn acquire(&self) {
        loop {
            let wait_ms = {
                let now = self.clock.now_ms();
                match self.window.lock() {
                    Ok(mut window) => match window.try_admit(now) {
                        Ok(_) => return,
                        Err(wait) => wait,
                    },
                    // Poisoned: admit without accounting
                    Err(_) => return,
                }
            };
            debug!(
                provider = %self.provider,
                wait_ms, "upstream rate limit reached, waiting for a slot"
            );
            self.clock.sleep(Duration::from_millis(wait_ms as u64)).await;
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}
