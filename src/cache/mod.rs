//! Two-tier, single-flight result cache in front of the upstream analyzers.
//!
//! Lookups go memory, then repository, then upstream. Concurrent misses for
//! the same key share one upstream call; the call runs in its own task so a
//! caller that gives up does not cancel it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::AnalysisContext;
use crate::storage::{Repository, StoredRecord};
use crate::upstream::Analyzer;

/// Where a returned result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheOutcome<T> {
    pub source: Source,
    pub result: T,
}

/// Memory entry. Reads refresh recency but never `expires_at_ms`.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at_ms: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub repository_hits: u64,
    pub misses: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub joined_in_flight: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    repository_hits: AtomicU64,
    misses: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
    joined_in_flight: AtomicU64,
    evictions: AtomicU64,
}

type InFlight<T> = Shared<BoxFuture<'static, Option<T>>>;

struct Inner<T> {
    namespace: String,
    ttl_ms: i64,
    memory: Mutex<LruCache<String, CacheEntry<T>>>,
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
    upstream: Arc<dyn Analyzer<T>>,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ResultCacheService<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResultCacheService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ResultCacheService<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        namespace: impl Into<String>,
        capacity: usize,
        ttl_ms: i64,
        upstream: Arc<dyn Analyzer<T>>,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                namespace: namespace.into(),
                ttl_ms: ttl_ms.max(1),
                memory: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
                upstream,
                repository,
                clock,
                counters: Counters::default(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub async fn analyze(&self, key: &str, text: &str) -> Option<CacheOutcome<T>> {
        self.analyze_with_context(key, text, None).await
    }

    /// Cached analysis for `key`, calling upstream with `context` on a full miss.
    /// `None` means no result could be produced.
    pub async fn analyze_with_context(
        &self,
        key: &str,
        text: &str,
        context: Option<AnalysisContext>,
    ) -> Option<CacheOutcome<T>> {
        let inner = &self.inner;

        if let Some(value) = inner.memory_get(key) {
            inner.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, namespace = %inner.namespace, "memory cache hit");
            return Some(CacheOutcome {
                source: Source::Cache,
                result: value,
            });
        }

        if let Some(value) = inner.repository_get(key).await {
            inner.counters.repository_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, namespace = %inner.namespace, "repository cache hit");
            return Some(CacheOutcome {
                source: Source::Cache,
                result: value,
            });
        }

        let flight = {
            let mut in_flight = lock(&inner.in_flight);
            // A flight may have finished between the memory check and here
            if let Some(value) = inner.memory_get(key) {
                inner.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(CacheOutcome {
                    source: Source::Cache,
                    result: value,
                });
            }
            match in_flight.get(key) {
                Some(existing) => {
                    inner.counters.joined_in_flight.fetch_add(1, Ordering::Relaxed);
                    debug!(key, namespace = %inner.namespace, "joining in-flight upstream call");
                    existing.clone()
                }
                None => {
                    inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key, namespace = %inner.namespace, "cache miss, calling upstream");
                    let task_inner = Arc::clone(inner);
                    let task_key = key.to_string();
                    let task_text = text.to_string();
                    // Spawned while the in-flight lock is held, so the task's own
                    // removal cannot run before this insert.
                    let handle = tokio::spawn(async move {
                        let _flight = FlightGuard {
                            inner: Arc::clone(&task_inner),
                            key: task_key.clone(),
                        };
                        task_inner.fill(task_key, task_text, context).await
                    });
                    let namespace = inner.namespace.clone();
                    let flight_key = key.to_string();
                    let flight: InFlight<T> = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => {
                                warn!(key = %flight_key, namespace = %namespace, "upstream fill task failed: {}", e);
                                None
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };

        flight.await.map(|result| CacheOutcome {
            source: Source::Upstream,
            result,
        })
    }

    /// Unexpired memory entry without touching recency or the repository
    pub fn peek(&self, key: &str) -> Option<T> {
        let now = self.inner.clock.now_ms();
        let memory = lock(&self.inner.memory);
        memory
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Drop the memory entry for `key`. Persisted rows are left alone.
    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.inner.memory).pop(key).is_some()
    }

    /// Entries held in memory, including expired ones not yet read
    pub fn len(&self) -> usize {
        lock(&self.inner.memory).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            repository_hits: c.repository_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            upstream_calls: c.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: c.upstream_failures.load(Ordering::Relaxed),
            joined_in_flight: c.joined_in_flight.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn memory_get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ms();
        let mut memory = lock(&self.memory);
        let expired = match memory.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            memory.pop(key);
            debug!(key, namespace = %self.namespace, "expired entry evicted on read");
        }
        None
    }

    fn memory_put(&self, key: String, value: T, expires_at_ms: i64) {
        let mut memory = lock(&self.memory);
        if let Some((evicted, _)) = memory.push(key.clone(), CacheEntry { value, expires_at_ms })
            && evicted != key
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %evicted, namespace = %self.namespace, "evicted oldest cache entry");
        }
    }

    /// Live, decodable row hydrated into memory with its own expiry
    async fn repository_get(&self, key: &str) -> Option<T> {
        let record = match self.repository.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, namespace = %self.namespace, "repository read failed: {}", e);
                return None;
            }
        };
        if !record.is_live(self.clock.now_ms()) {
            return None;
        }
        match serde_json::from_value::<T>(record.payload) {
            Ok(value) => {
                self.memory_put(key.to_string(), value.clone(), record.expires_at_ms);
                Some(value)
            }
            Err(e) => {
                debug!(key, namespace = %self.namespace, "undecodable repository row: {}", e);
                None
            }
        }
    }

    async fn fill(
        self: Arc<Self>,
        key: String,
        text: String,
        context: Option<AnalysisContext>,
    ) -> Option<T> {
        self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.upstream.analyze(&key, &text, context.as_ref()).await;

        match &result {
            Some(value) => {
                let now = self.clock.now_ms();
                let expires_at_ms = now + self.ttl_ms;
                self.memory_put(key.clone(), value.clone(), expires_at_ms);
                match serde_json::to_value(value) {
                    Ok(payload) => {
                        let record = StoredRecord {
                            key: key.clone(),
                            namespace: self.namespace.clone(),
                            payload,
                            expires_at_ms,
                            updated_at_ms: now,
                        };
                        if let Err(e) = self.repository.upsert(record).await {
                            warn!(
                                key = %key,
                                namespace = %self.namespace,
                                "repository write failed, continuing memory-only: {}",
                                e
                            );
                        }
                    }
                    Err(e) => warn!(key = %key, "could not serialize result for persistence: {}", e),
                }
            }
            None => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }
}

/// Clears the in-flight entry when the fill task ends, including by panic
struct FlightGuard<T> {
    inner: Arc<Inner<T>>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.key);
    }
}
