//! In-process store implementations for development and tests

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{
    ProfileStore, QuotaCounter, QuotaIncrement, QuotaStore, Repository, StoredRecord,
};
use crate::error::Result;
use crate::models::UserProfile;

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    rows: RwLock<HashMap<String, StoredRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn upsert(&self, record: StoredRecord) -> Result<()> {
        self.rows.write().await.insert(record.key.clone(), record);
        Ok(())
    }
}

/// Counter map guarded by a single lock, which makes compare-and-increment atomic
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    counters: Mutex<HashMap<(String, String), u64>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a counter, e.g. to simulate usage from another process
    pub async fn set(&self, user_id: &str, period_key: &str, used: u64) {
        self.counters
            .lock()
            .await
            .insert((user_id.to_string(), period_key.to_string()), used);
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn read(&self, user_id: &str, period_key: &str) -> Result<u64> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(&(user_id.to_string(), period_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn increment_if_below(
        &self,
        user_id: &str,
        counters: &[QuotaCounter],
    ) -> Result<QuotaIncrement> {
        let mut map = self.counters.lock().await;
        for counter in counters {
            let used = map
                .get(&(user_id.to_string(), counter.period_key.clone()))
                .copied()
                .unwrap_or(0);
            if used >= counter.limit {
                return Ok(QuotaIncrement::LimitReached {
                    period_key: counter.period_key.clone(),
                    used,
                });
            }
        }
        let mut used = Vec::with_capacity(counters.len());
        for counter in counters {
            let slot = map
                .entry((user_id.to_string(), counter.period_key.clone()))
                .or_insert(0);
            *slot += 1;
            used.push(*slot);
        }
        Ok(QuotaIncrement::Incremented { used })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn put_profile(&self, profile: UserProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }
}
