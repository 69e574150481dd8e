//! Persistence seams: analysis repository, quota counters and user profiles.
//!
//! The in-process caches are authoritative for the running process; these
//! stores are the cross-process source of truth and are allowed to fail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::UserProfile;

pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryProfileStore, InMemoryQuotaStore, InMemoryRepository};
pub use sqlite::SqliteStore;

/// Row shape persisted for a cached analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub key: String,
    pub namespace: String,
    pub payload: serde_json::Value,
    pub expires_at_ms: i64,
    pub updated_at_ms: i64,
}

impl StoredRecord {
    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;
    async fn upsert(&self, record: StoredRecord) -> Result<()>;
}

/// One counter participating in a compare-and-increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCounter {
    pub period_key: String,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaIncrement {
    /// Every counter was below its limit and has been incremented; values in input order
    Incremented { used: Vec<u64> },
    /// Nothing was incremented because this counter is already at its limit
    LimitReached { period_key: String, used: u64 },
}

/// Remote authoritative quota counters keyed by user id and period.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn read(&self, user_id: &str, period_key: &str) -> Result<u64>;

    /// Atomically increment every counter, or none of them if any is at its limit.
    async fn increment_if_below(
        &self,
        user_id: &str,
        counters: &[QuotaCounter],
    ) -> Result<QuotaIncrement>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn put_profile(&self, profile: UserProfile) -> Result<()>;
}
