//! Result cache behaviour: single flight, TTL, eviction and degraded persistence

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FailingRepository, StubAnalyzer, tweet_100_result};
use counterpoint::cache::{ResultCacheService, Source};
use counterpoint::clock::{Clock, ManualClock};
use counterpoint::models::Phase1Analysis;
use counterpoint::storage::{InMemoryRepository, Repository, StoredRecord};
use futures_util::future::join_all;

const TTL: i64 = 24 * 60 * 60 * 1000;

fn build(
    analyzer: Arc<StubAnalyzer<Phase1Analysis>>,
    repository: Arc<dyn Repository>,
    clock: Arc<ManualClock>,
    capacity: usize,
) -> ResultCacheService<Phase1Analysis> {
    ResultCacheService::new("phase1", capacity, TTL, analyzer, repository, clock)
}

#[tokio::test]
async fn tweet_100_upstream_then_cache() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = build(analyzer.clone(), Arc::new(InMemoryRepository::new()), clock, 100);

    let first = cache
        .analyze("tweet-100", "This is a political tweet")
        .await
        .expect("first analysis");
    let second = cache
        .analyze("tweet-100", "This is a political tweet")
        .await
        .expect("second analysis");

    assert_eq!(first.source, Source::Upstream);
    assert_eq!(second.source, Source::Cache);
    assert_eq!(first.result, second.result);
    assert_eq!(first.result, tweet_100_result());
    assert_eq!(analyzer.calls(), 1);
}

#[tokio::test]
async fn concurrent_misses_share_one_upstream_call() {
    let analyzer = Arc::new(StubAnalyzer::slow(
        Some(tweet_100_result()),
        Duration::from_millis(50),
    ));
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(analyzer.clone(), Arc::new(InMemoryRepository::new()), clock, 100);

    let calls = (0..10).map(|_| {
        let cache = cache.clone();
        async move { cache.analyze("tweet-7", "same text").await }
    });
    let results = join_all(calls).await;

    assert_eq!(analyzer.calls(), 1);
    assert!(results.iter().all(|r| r.as_ref().map(|o| &o.result) == Some(&tweet_100_result())));
    assert_eq!(cache.in_flight(), 0);
    assert!(cache.stats().joined_in_flight >= 1);
}

#[tokio::test]
async fn different_keys_do_not_share_flights() {
    let analyzer = Arc::new(StubAnalyzer::slow(
        Some(tweet_100_result()),
        Duration::from_millis(20),
    ));
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(analyzer.clone(), Arc::new(InMemoryRepository::new()), clock, 100);

    let (a, b) = tokio::join!(cache.analyze("a", "text"), cache.analyze("b", "text"));
    assert!(a.is_some() && b.is_some());
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn concurrent_failures_all_see_none() {
    let analyzer = Arc::new(StubAnalyzer::<Phase1Analysis>::slow(
        None,
        Duration::from_millis(30),
    ));
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(analyzer.clone(), Arc::new(InMemoryRepository::new()), clock, 100);

    let results = join_all((0..5).map(|_| cache.analyze("k", "text"))).await;
    assert!(results.iter().all(Option::is_none));
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(cache.in_flight(), 0);

    // Nothing was cached, so the next call goes upstream again
    assert!(cache.analyze("k", "text").await.is_none());
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn ttl_hit_before_expiry_miss_at_expiry() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let t0 = 5_000;
    let clock = Arc::new(ManualClock::new(t0));
    let cache = build(
        analyzer.clone(),
        Arc::new(InMemoryRepository::new()),
        clock.clone(),
        100,
    );

    assert_eq!(cache.analyze("k", "t").await.unwrap().source, Source::Upstream);

    clock.set(t0 + TTL - 1);
    assert_eq!(cache.analyze("k", "t").await.unwrap().source, Source::Cache);

    clock.set(t0 + TTL);
    assert_eq!(cache.analyze("k", "t").await.unwrap().source, Source::Upstream);
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn reads_do_not_extend_expiry() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(
        analyzer.clone(),
        Arc::new(FailingRepository::default()),
        clock.clone(),
        100,
    );

    cache.analyze("k", "t").await.unwrap();
    for step in 1..=4 {
        clock.set(step * (TTL / 5));
        assert_eq!(cache.analyze("k", "t").await.unwrap().source, Source::Cache);
    }
    clock.set(TTL);
    assert_eq!(cache.analyze("k", "t").await.unwrap().source, Source::Upstream);
}

#[tokio::test]
async fn capacity_is_never_exceeded_and_oldest_goes_first() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let clock = Arc::new(ManualClock::new(0));
    // Failing repository keeps evicted entries from being re-hydrated
    let cache = build(
        analyzer.clone(),
        Arc::new(FailingRepository::default()),
        clock,
        3,
    );

    for key in ["a", "b", "c", "d", "e"] {
        cache.analyze(key, "t").await.unwrap();
        assert!(cache.len() <= 3);
    }
    assert_eq!(cache.len(), 3);
    assert!(cache.peek("a").is_none());
    assert!(cache.peek("b").is_none());
    assert!(cache.peek("e").is_some());

    // Reading "c" makes it most recent, so "d" is evicted next
    assert_eq!(cache.analyze("c", "t").await.unwrap().source, Source::Cache);
    cache.analyze("f", "t").await.unwrap();
    assert!(cache.peek("c").is_some());
    assert!(cache.peek("d").is_none());
}

#[tokio::test]
async fn degraded_persistence_still_caches_in_memory() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let repository = Arc::new(FailingRepository::default());
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(analyzer.clone(), repository.clone(), clock, 100);

    let first = cache.analyze("tweet-100", "This is a political tweet").await.unwrap();
    let second = cache.analyze("tweet-100", "This is a political tweet").await.unwrap();

    assert_eq!(first.source, Source::Upstream);
    assert_eq!(second.source, Source::Cache);
    assert_eq!(repository.writes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repository_rows_hydrate_memory_with_their_own_expiry() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let repository = Arc::new(InMemoryRepository::new());
    let clock = Arc::new(ManualClock::new(10_000));
    repository
        .upsert(StoredRecord {
            key: "k".into(),
            namespace: "phase1".into(),
            payload: serde_json::to_value(tweet_100_result()).unwrap(),
            expires_at_ms: 10_500,
            updated_at_ms: 9_000,
        })
        .await
        .unwrap();
    let cache = build(analyzer.clone(), repository, clock.clone(), 100);

    let hit = cache.analyze("k", "t").await.unwrap();
    assert_eq!(hit.source, Source::Cache);
    assert_eq!(analyzer.calls(), 0);
    assert_eq!(cache.stats().repository_hits, 1);

    clock.set(10_499);
    assert!(cache.peek("k").is_some());
    clock.set(10_500);
    assert!(cache.peek("k").is_none());
}

#[tokio::test]
async fn expired_or_undecodable_rows_are_misses() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let repository = Arc::new(InMemoryRepository::new());
    let clock = Arc::new(ManualClock::new(10_000));
    for (key, payload, expires) in [
        ("expired", serde_json::to_value(tweet_100_result()).unwrap(), 10_000),
        ("garbage", serde_json::json!({"vector": "nope"}), 99_999),
    ] {
        repository
            .upsert(StoredRecord {
                key: key.into(),
                namespace: "phase1".into(),
                payload,
                expires_at_ms: expires,
                updated_at_ms: 0,
            })
            .await
            .unwrap();
    }
    let cache = build(analyzer.clone(), repository, clock, 100);

    assert_eq!(cache.analyze("expired", "t").await.unwrap().source, Source::Upstream);
    assert_eq!(cache.analyze("garbage", "t").await.unwrap().source, Source::Upstream);
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn upstream_results_are_persisted() {
    let analyzer = Arc::new(StubAnalyzer::returning(Some(tweet_100_result())));
    let repository = Arc::new(InMemoryRepository::new());
    let clock = Arc::new(ManualClock::new(42));
    let cache = build(analyzer, repository.clone(), clock.clone(), 100);

    cache.analyze("tweet-100", "text").await.unwrap();
    let row = repository.get("tweet-100").await.unwrap().expect("row written");
    assert_eq!(row.namespace, "phase1");
    assert_eq!(row.expires_at_ms, clock.now_ms() + TTL);
    assert_eq!(row.updated_at_ms, 42);
    let decoded: Phase1Analysis = serde_json::from_value(row.payload).unwrap();
    assert_eq!(decoded, tweet_100_result());
}

#[tokio::test]
async fn abandoned_callers_do_not_cancel_upstream_work() {
    let analyzer = Arc::new(StubAnalyzer::slow(
        Some(tweet_100_result()),
        Duration::from_millis(60),
    ));
    let clock = Arc::new(ManualClock::new(0));
    let cache = build(analyzer.clone(), Arc::new(InMemoryRepository::new()), clock, 100);

    let gave_up = tokio::time::timeout(Duration::from_millis(5), cache.analyze("k", "t")).await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.peek("k"), Some(tweet_100_result()));
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(analyzer.calls(), 1);
}

/// Panics on its first call, then behaves
struct PanicsOnce {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl counterpoint::upstream::Analyzer<Phase1Analysis> for PanicsOnce {
    async fn analyze(
        &self,
        _id: &str,
        _text: &str,
        _context: Option<&counterpoint::models::AnalysisContext>,
    ) -> Option<Phase1Analysis> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == 0 {
            panic!("analyzer blew up");
        }
        Some(tweet_100_result())
    }
}

#[tokio::test]
async fn panicking_fill_releases_the_key() {
    let analyzer = Arc::new(PanicsOnce {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let clock = Arc::new(ManualClock::new(0));
    let cache: ResultCacheService<Phase1Analysis> = ResultCacheService::new(
        "phase1",
        100,
        TTL,
        analyzer.clone(),
        Arc::new(InMemoryRepository::new()),
        clock,
    );

    assert!(cache.analyze("tweet-9", "text").await.is_none());
    assert_eq!(cache.in_flight(), 0);

    let retry = cache.analyze("tweet-9", "text").await.expect("second attempt reaches upstream");
    assert_eq!(retry.source, Source::Upstream);
    assert_eq!(analyzer.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}
