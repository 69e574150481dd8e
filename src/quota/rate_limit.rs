//! Keyed sliding-window limiter for inbound requests

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use super::{Rejection, RejectionCode};
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::utils::SlidingWindow;
use crate::utils::keys::fingerprint;

/// Identities tracked at once; the least recently seen are dropped first
const MAX_TRACKED_IDENTITIES: usize = 100_000;

/// Rate-limit identity for a request, most specific credential first.
/// Credentials are fingerprinted so raw secrets never become map keys.
pub fn request_identity(
    authorization: Option<&str>,
    api_key: Option<&str>,
    forwarded_for: Option<&str>,
) -> String {
    fn present(v: Option<&str>) -> Option<&str> {
        v.map(str::trim).filter(|v| !v.is_empty())
    }
    if let Some(auth) = present(authorization) {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth);
        return format!("auth:{}", fingerprint(token));
    }
    if let Some(key) = present(api_key) {
        return format!("key:{}", fingerprint(key));
    }
    if let Some(ip) = present(forwarded_for).and_then(|v| v.split(',').next()).map(str::trim)
        && !ip.is_empty()
    {
        return format!("ip:{}", ip);
    }
    "anonymous".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: usize,
    pub remaining: usize,
}

pub struct RequestRateLimiter {
    enabled: bool,
    window_ms: i64,
    max_requests: usize,
    windows: Mutex<LruCache<String, SlidingWindow>>,
    clock: Arc<dyn Clock>,
}

impl RequestRateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_IDENTITIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.enabled,
            window_ms: config.window_ms,
            max_requests: config.max_requests,
            windows: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject one request for `identity`. Never blocks.
    pub fn check(&self, identity: &str) -> Result<RateLimitStatus, Rejection> {
        if !self.enabled {
            return Ok(RateLimitStatus {
                limit: self.max_requests,
                remaining: self.max_requests,
            });
        }
        let now = self.clock.now_ms();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.get_or_insert_mut(identity.to_string(), || {
            SlidingWindow::new(self.window_ms, self.max_requests)
        });
        match window.try_admit(now) {
            Ok(remaining) => Ok(RateLimitStatus {
                limit: window.max_requests(),
                remaining,
            }),
            Err(wait_ms) => {
                let retry_after_secs = ((wait_ms + 999) / 1000).max(1) as u64;
                debug!(identity, wait_ms, "request rate limit exceeded");
                Err(Rejection {
                    code: RejectionCode::RateLimited,
                    message: format!(
                        "Too many requests; limit is {} per {}s",
                        self.max_requests,
                        self.window_ms / 1000
                    ),
                    retry_after_secs,
                })
            }
        }
    }
}
