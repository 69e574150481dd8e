//! Upstream failure classification.
//!
//! Maps a transport failure into the closed retry taxonomy and computes the
//! delay before the next attempt. Only `Timeout`, `Network` and `Http` with
//! status 429 or >= 500 are ever retried; everything else is terminal.

use std::time::Duration;

use serde::Serialize;

use super::transport::UpstreamFailure;

/// The only failure shapes the retry loop will act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryableError {
    Timeout,
    Network,
    Http {
        status: u16,
        retry_after_ms: Option<u64>,
    },
}

/// Result of a single upstream attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    Ok(T),
    Retry(RetryableError),
    Fatal(String),
}

impl<T> AttemptOutcome<T> {
    pub fn from_failure(failure: &UpstreamFailure) -> Self {
        match classify(failure) {
            Some(retryable) => AttemptOutcome::Retry(retryable),
            None => AttemptOutcome::Fatal(failure.to_string()),
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// `Some` when the failure may succeed on retry
pub fn classify(failure: &UpstreamFailure) -> Option<RetryableError> {
    match failure {
        UpstreamFailure::Timeout { .. } => Some(RetryableError::Timeout),
        UpstreamFailure::Network(_) => Some(RetryableError::Network),
        UpstreamFailure::Http {
            status,
            retry_after_ms,
            ..
        } if is_retryable_status(*status) => Some(RetryableError::Http {
            status: *status,
            retry_after_ms: *retry_after_ms,
        }),
        UpstreamFailure::Http { .. } | UpstreamFailure::Malformed(_) => None,
    }
}

/// Delay after failed attempt number `attempt` (1-based).
/// A server-provided `Retry-After` wins, capped at `max_retry_after`;
/// otherwise `base * 2^(attempt-1)`.
pub fn backoff_delay(
    error: &RetryableError,
    attempt: u32,
    base: Duration,
    max_retry_after: Duration,
) -> Duration {
    if let RetryableError::Http {
        retry_after_ms: Some(ms),
        ..
    } = error
    {
        return Duration::from_millis(*ms).min(max_retry_after);
    }
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}
