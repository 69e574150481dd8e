//! Sliding-window request log shared by the upstream and request-rate limiters

use std::collections::VecDeque;

/// Timestamps of admitted requests inside the trailing window.
///
/// A timestamp `t` is inside the window at `now` while `now - t < window_ms`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_ms: i64,
    max_requests: usize,
    stamps: VecDeque<i64>,
}

impl SlidingWindow {
    pub fn new(window_ms: i64, max_requests: usize) -> Self {
        Self {
            window_ms: window_ms.max(1),
            max_requests: max_requests.max(1),
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now_ms: i64) {
        while let Some(&oldest) = self.stamps.front() {
            if now_ms - oldest >= self.window_ms {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record `now_ms` if a slot is free. Otherwise return how long until the
    /// oldest admitted timestamp leaves the window.
    pub fn try_admit(&mut self, now_ms: i64) -> Result<usize, i64> {
        self.prune(now_ms);
        if self.stamps.len() < self.max_requests {
            self.stamps.push_back(now_ms);
            Ok(self.max_requests - self.stamps.len())
        } else {
            let oldest = self.stamps.front().copied().unwrap_or(now_ms);
            Err((oldest + self.window_ms - now_ms).max(1))
        }
    }

    /// Number of admitted requests still inside the window
    pub fn in_window(&mut self, now_ms: i64) -> usize {
        self.prune(now_ms);
        self.stamps.len()
    }

    pub fn is_idle(&mut self, now_ms: i64) -> bool {
        self.in_window(now_ms) == 0
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }
}
