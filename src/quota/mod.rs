//! Per-user daily/monthly allowances and the inbound request-rate limiter.
//!
//! Counters live in a [`QuotaStore`]; this service keeps a short-lived local
//! copy for reads. Only [`QuotaService::increment_quota`] mutates, and it does
//! so with one compare-and-increment covering both periods.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::storage::{QuotaCounter, QuotaIncrement, QuotaStore};

pub mod rate_limit;

pub use rate_limit::{RateLimitStatus, RequestRateLimiter, request_identity};

/// Machine-readable rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    RateLimited,
    DailyQuotaExceeded,
    MonthlyQuotaExceeded,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::RateLimited => "RATE_LIMITED",
            RejectionCode::DailyQuotaExceeded => "DAILY_QUOTA_EXCEEDED",
            RejectionCode::MonthlyQuotaExceeded => "MONTHLY_QUOTA_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
    /// Seconds until retrying can succeed, never below 1
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub resets_at: DateTime<Utc>,
}

impl QuotaStatus {
    fn new(used: u64, limit: u64, resets_at: DateTime<Utc>) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub daily: QuotaStatus,
    pub monthly: QuotaStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaCheck {
    /// Caller supplied their own upstream credential
    Bypassed,
    Allowed(QuotaSnapshot),
    Rejected(Rejection),
}

/// The two accounting periods for one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Periods {
    pub day_key: String,
    pub month_key: String,
    pub day_resets_at: DateTime<Utc>,
    pub month_resets_at: DateTime<Utc>,
}

impl Periods {
    pub fn at(now_ms: i64) -> Self {
        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let today = now.date_naive();
        let tomorrow = today.succ_opt().unwrap_or(today);
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        let next_month = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(tomorrow);
        let midnight = |d: NaiveDate| {
            d.and_hms_opt(0, 0, 0)
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or(now + ChronoDuration::days(1))
        };
        Self {
            day_key: format!("d:{}", now.format("%Y-%m-%d")),
            month_key: format!("m:{}", now.format("%Y-%m")),
            day_resets_at: midnight(tomorrow),
            month_resets_at: midnight(next_month),
        }
    }
}

fn secs_until(now_ms: i64, at: DateTime<Utc>) -> u64 {
    let ms = at.timestamp_millis() - now_ms;
    ((ms + 999) / 1000).max(1) as u64
}

#[derive(Debug, Clone, Copy)]
struct LocalCount {
    used: u64,
    fetched_at_ms: i64,
}

pub struct QuotaService {
    store: Arc<dyn QuotaStore>,
    daily_limit: u64,
    monthly_limit: u64,
    local_ttl_ms: i64,
    local: Mutex<LruCache<String, LocalCount>>,
    clock: Arc<dyn Clock>,
}

impl QuotaService {
    pub fn new(config: &QuotaConfig, store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.local_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            daily_limit: config.daily_limit,
            monthly_limit: config.monthly_limit,
            local_ttl_ms: config.local_ttl_ms.max(0),
            local: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    fn local_key(user_id: &str, period_key: &str) -> String {
        format!("{}|{}", user_id, period_key)
    }

    fn local_get(&self, key: &str) -> Option<LocalCount> {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn local_put(&self, key: String, used: u64) {
        let fetched_at_ms = self.clock.now_ms();
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, LocalCount { used, fetched_at_ms });
    }

    /// Read-through: fresh local copy, else the store, else the stale copy or 0
    async fn used(&self, user_id: &str, period_key: &str) -> u64 {
        let key = Self::local_key(user_id, period_key);
        let cached = self.local_get(&key);
        let now = self.clock.now_ms();
        if let Some(c) = cached
            && now - c.fetched_at_ms < self.local_ttl_ms
        {
            return c.used;
        }
        match self.store.read(user_id, period_key).await {
            Ok(used) => {
                self.local_put(key, used);
                used
            }
            Err(e) => {
                warn!(user_id, period_key, "quota store read failed, failing open: {}", e);
                cached.map(|c| c.used).unwrap_or(0)
            }
        }
    }

    pub async fn status(&self, user_id: &str) -> QuotaSnapshot {
        let periods = Periods::at(self.clock.now_ms());
        let daily = self.used(user_id, &periods.day_key).await;
        let monthly = self.used(user_id, &periods.month_key).await;
        QuotaSnapshot {
            daily: QuotaStatus::new(daily, self.daily_limit, periods.day_resets_at),
            monthly: QuotaStatus::new(monthly, self.monthly_limit, periods.month_resets_at),
        }
    }

    fn rejection_for(&self, code: RejectionCode, now_ms: i64, periods: &Periods) -> Rejection {
        let (limit, resets_at, label) = match code {
            RejectionCode::MonthlyQuotaExceeded => {
                (self.monthly_limit, periods.month_resets_at, "Monthly")
            }
            _ => (self.daily_limit, periods.day_resets_at, "Daily"),
        };
        Rejection {
            code,
            message: format!(
                "{} analysis quota of {} reached; resets at {}",
                label,
                limit,
                resets_at.to_rfc3339()
            ),
            retry_after_secs: secs_until(now_ms, resets_at),
        }
    }

    /// Admission check before an analysis. Does not consume quota.
    pub async fn check_quota(&self, user_id: &str, byok: bool) -> QuotaCheck {
        if byok {
            debug!(user_id, "BYOK credential present, quota bypassed");
            return QuotaCheck::Bypassed;
        }
        let now = self.clock.now_ms();
        let periods = Periods::at(now);
        let snapshot = self.status(user_id).await;
        if snapshot.monthly.exhausted() {
            return QuotaCheck::Rejected(self.rejection_for(
                RejectionCode::MonthlyQuotaExceeded,
                now,
                &periods,
            ));
        }
        if snapshot.daily.exhausted() {
            return QuotaCheck::Rejected(self.rejection_for(
                RejectionCode::DailyQuotaExceeded,
                now,
                &periods,
            ));
        }
        QuotaCheck::Allowed(snapshot)
    }

    /// Count one analysis against both periods, all or nothing
    pub async fn increment_quota(&self, user_id: &str) -> Result<QuotaSnapshot, Rejection> {
        let now = self.clock.now_ms();
        let periods = Periods::at(now);
        let counters = [
            QuotaCounter {
                period_key: periods.day_key.clone(),
                limit: self.daily_limit,
            },
            QuotaCounter {
                period_key: periods.month_key.clone(),
                limit: self.monthly_limit,
            },
        ];
        let day_local = Self::local_key(user_id, &periods.day_key);
        let month_local = Self::local_key(user_id, &periods.month_key);

        let (daily, monthly) = match self.store.increment_if_below(user_id, &counters).await {
            Ok(QuotaIncrement::Incremented { used }) => {
                let daily = used.first().copied().unwrap_or(0);
                let monthly = used.get(1).copied().unwrap_or(0);
                self.local_put(day_local, daily);
                self.local_put(month_local, monthly);
                (daily, monthly)
            }
            Ok(QuotaIncrement::LimitReached { period_key, used }) => {
                let code = if period_key == periods.month_key {
                    RejectionCode::MonthlyQuotaExceeded
                } else {
                    RejectionCode::DailyQuotaExceeded
                };
                self.local_put(Self::local_key(user_id, &period_key), used);
                debug!(user_id, period_key = %period_key, used, "quota limit reached");
                return Err(self.rejection_for(code, now, &periods));
            }
            Err(e) => {
                warn!(user_id, "quota store increment failed, failing open: {}", e);
                let daily = self.local_get(&day_local).map(|c| c.used).unwrap_or(0) + 1;
                let monthly = self.local_get(&month_local).map(|c| c.used).unwrap_or(0) + 1;
                self.local_put(day_local, daily);
                self.local_put(month_local, monthly);
                (daily, monthly)
            }
        };

        Ok(QuotaSnapshot {
            daily: QuotaStatus::new(daily, self.daily_limit, periods.day_resets_at),
            monthly: QuotaStatus::new(monthly, self.monthly_limit, periods.month_resets_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T10:00:00Z
    const MID_MARCH: i64 = 1_710_496_800_000;
    // 2024-12-31T23:59:59Z
    const NEW_YEARS_EVE: i64 = 1_735_689_599_000;

    #[test]
    fn period_keys_and_resets() {
        let p = Periods::at(MID_MARCH);
        assert_eq!(p.day_key, "d:2024-03-15");
        assert_eq!(p.month_key, "m:2024-03");
        assert_eq!(p.day_resets_at.to_rfc3339(), "2024-03-16T00:00:00+00:00");
        assert_eq!(p.month_resets_at.to_rfc3339(), "2024-04-01T00:00:00+00:00");
    }

    #[test]
    fn december_rolls_into_next_year() {
        let p = Periods::at(NEW_YEARS_EVE);
        assert_eq!(p.month_key, "m:2024-12");
        assert_eq!(p.month_resets_at.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(secs_until(NEW_YEARS_EVE, p.day_resets_at), 1);
    }

    #[test]
    fn remaining_never_negative() {
        let status = QuotaStatus::new(12, 10, Utc::now());
        assert_eq!(status.remaining, 0);
        assert!(status.exhausted());
    }

    #[test]
    fn codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_value(RejectionCode::DailyQuotaExceeded).unwrap(),
            serde_json::json!("DAILY_QUOTA_EXCEEDED")
        );
        assert_eq!(RejectionCode::RateLimited.as_str(), "RATE_LIMITED");
    }
}
