//! Quota service: admission, atomic increments, bypass and fail-open reads

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use counterpoint::clock::ManualClock;
use counterpoint::config::QuotaConfig;
use counterpoint::error::{CounterpointError, Result};
use counterpoint::quota::{Periods, QuotaCheck, QuotaService, RejectionCode};
use counterpoint::storage::{InMemoryQuotaStore, QuotaCounter, QuotaIncrement, QuotaStore, SqliteStore};

// 2024-03-15T10:00:00Z
const NOW: i64 = 1_710_496_800_000;

fn config(daily: u64, monthly: u64) -> QuotaConfig {
    QuotaConfig {
        daily_limit: daily,
        monthly_limit: monthly,
        local_ttl_ms: 60_000,
        local_capacity: 100,
    }
}

#[tokio::test]
async fn increments_until_daily_limit() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = QuotaService::new(&config(2, 100), store, clock);

    let first = quota.increment_quota("u1").await.unwrap();
    assert_eq!(first.daily.used, 1);
    assert_eq!(first.daily.remaining, 1);
    let second = quota.increment_quota("u1").await.unwrap();
    assert_eq!(second.daily.remaining, 0);

    let rejection = quota.increment_quota("u1").await.unwrap_err();
    assert_eq!(rejection.code, RejectionCode::DailyQuotaExceeded);
    // 14 hours until midnight UTC
    assert_eq!(rejection.retry_after_secs, 14 * 3600);

    match quota.check_quota("u1", false).await {
        QuotaCheck::Rejected(r) => assert_eq!(r.code, RejectionCode::DailyQuotaExceeded),
        other => panic!("expected rejection, got {:?}", other),
    }
    // other users are unaffected
    assert!(matches!(quota.check_quota("u2", false).await, QuotaCheck::Allowed(_)));
}

#[tokio::test]
async fn monthly_limit_wins_and_nothing_is_half_incremented() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let periods = Periods::at(NOW);
    store.set("u1", &periods.month_key, 10).await;
    let quota = QuotaService::new(&config(5, 10), store.clone(), clock);

    let rejection = quota.increment_quota("u1").await.unwrap_err();
    assert_eq!(rejection.code, RejectionCode::MonthlyQuotaExceeded);
    assert_eq!(store.read("u1", &periods.day_key).await.unwrap(), 0);
    assert_eq!(store.read("u1", &periods.month_key).await.unwrap(), 10);
}

#[tokio::test]
async fn byok_bypasses_quota() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = QuotaService::new(&config(0, 0), store, clock);

    assert_eq!(quota.check_quota("u1", true).await, QuotaCheck::Bypassed);
    assert!(matches!(quota.check_quota("u1", false).await, QuotaCheck::Rejected(_)));
}

#[tokio::test]
async fn reads_are_cached_locally_for_the_ttl() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let periods = Periods::at(NOW);
    let quota = QuotaService::new(&config(10, 100), store.clone(), clock.clone());

    assert_eq!(quota.status("u1").await.daily.used, 0);
    // another process consumes quota
    store.set("u1", &periods.day_key, 7).await;
    assert_eq!(quota.status("u1").await.daily.used, 0);

    clock.advance(60_000);
    assert_eq!(quota.status("u1").await.daily.used, 7);
}

#[tokio::test]
async fn new_day_starts_a_fresh_counter() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = QuotaService::new(&config(1, 100), store, clock.clone());

    quota.increment_quota("u1").await.unwrap();
    assert!(quota.increment_quota("u1").await.is_err());

    clock.advance(24 * 3600 * 1000);
    let next = quota.increment_quota("u1").await.unwrap();
    assert_eq!(next.daily.used, 1);
    assert_eq!(next.monthly.used, 2);
}

#[derive(Default)]
struct FlakyStore {
    inner: InMemoryQuotaStore,
    failing: std::sync::atomic::AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl QuotaStore for FlakyStore {
    async fn read(&self, user_id: &str, period_key: &str) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CounterpointError::Storage {
                message: "quota store unreachable".into(),
            });
        }
        self.inner.read(user_id, period_key).await
    }

    async fn increment_if_below(
        &self,
        user_id: &str,
        counters: &[QuotaCounter],
    ) -> Result<QuotaIncrement> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CounterpointError::Storage {
                message: "quota store unreachable".into(),
            });
        }
        self.inner.increment_if_below(user_id, counters).await
    }
}

#[tokio::test]
async fn store_failures_fail_open_with_last_known_values() {
    let store = Arc::new(FlakyStore::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = QuotaService::new(&config(10, 100), store.clone(), clock.clone());

    quota.increment_quota("u1").await.unwrap();
    quota.increment_quota("u1").await.unwrap();

    store.failing.store(true, Ordering::SeqCst);
    clock.advance(120_000);

    let status = quota.status("u1").await;
    assert_eq!(status.daily.used, 2);
    assert!(matches!(quota.check_quota("u1", false).await, QuotaCheck::Allowed(_)));
    let bumped = quota.increment_quota("u1").await.unwrap();
    assert_eq!(bumped.daily.used, 3);

    // unknown users read as zero while the store is down
    assert_eq!(quota.status("u9").await.daily.used, 0);
}

#[tokio::test]
async fn sqlite_store_backs_the_service() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = QuotaService::new(&config(2, 3), store, clock.clone());

    quota.increment_quota("u1").await.unwrap();
    quota.increment_quota("u1").await.unwrap();
    assert_eq!(
        quota.increment_quota("u1").await.unwrap_err().code,
        RejectionCode::DailyQuotaExceeded
    );

    clock.advance(24 * 3600 * 1000);
    let snapshot = quota.increment_quota("u1").await.unwrap();
    assert_eq!(snapshot.monthly.used, 3);
    assert_eq!(
        quota.increment_quota("u1").await.unwrap_err().code,
        RejectionCode::MonthlyQuotaExceeded
    );
}

#[tokio::test]
async fn concurrent_increments_never_exceed_the_limit() {
    let store = Arc::new(InMemoryQuotaStore::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let quota = Arc::new(QuotaService::new(&config(5, 100), store.clone(), clock));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let quota = quota.clone();
            tokio::spawn(async move { quota.increment_quota("u1").await.is_ok() })
        })
        .collect();
    let mut granted = 0;
    for h in handles {
        if h.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
    assert_eq!(
        store.read("u1", &Periods::at(NOW).day_key).await.unwrap(),
        5
    );
}
