//! SQLite-backed repository, quota counters and profile store.
//!
//! rusqlite is blocking, so every call runs on the blocking pool behind a
//! shared connection. One connection serializes writers, which is what makes
//! the quota compare-and-increment atomic.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::{
    ProfileStore, QuotaCounter, QuotaIncrement, QuotaStore, Repository, StoredRecord,
};
use crate::error::{CounterpointError, Result};
use crate::models::{ContentVector, UserProfile};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS analyses (
    cache_key TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    payload TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS quota_counters (
    user_id TEXT NOT NULL,
    period_key TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, period_key)
);
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    social REAL NOT NULL,
    economic REAL NOT NULL,
    populist REAL NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CounterpointError::Storage {
                message: format!("creating {}: {}", parent.display(), e),
            })?;
        }
        let conn = Connection::open(path)?;
        // WAL lets other processes read while we write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| CounterpointError::Storage {
                message: "sqlite connection lock poisoned".to_string(),
            })?;
            op(&mut *guard)
        })
        .await?
    }
}

#[async_trait]
impl Repository for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .prepare_cached(
                    "SELECT cache_key, namespace, payload, expires_at_ms, updated_at_ms
                     FROM analyses WHERE cache_key = ?1",
                )?
                .query_row([&key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .optional()?;
            match row {
                Some((key, namespace, payload, expires_at_ms, updated_at_ms)) => {
                    Ok(Some(StoredRecord {
                        key,
                        namespace,
                        payload: serde_json::from_str(&payload)?,
                        expires_at_ms,
                        updated_at_ms,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn upsert(&self, record: StoredRecord) -> Result<()> {
        self.with_conn(move |conn| {
            let payload = serde_json::to_string(&record.payload)?;
            conn.execute(
                "INSERT INTO analyses (cache_key, namespace, payload, expires_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    namespace = ?2, payload = ?3, expires_at_ms = ?4, updated_at_ms = ?5",
                params![
                    record.key,
                    record.namespace,
                    payload,
                    record.expires_at_ms,
                    record.updated_at_ms
                ],
            )?;
            debug!(key = %record.key, "Persisted analysis");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn read(&self, user_id: &str, period_key: &str) -> Result<u64> {
        let (user_id, period_key) = (user_id.to_string(), period_key.to_string());
        self.with_conn(move |conn| {
            let used: Option<i64> = conn
                .prepare_cached(
                    "SELECT used FROM quota_counters WHERE user_id = ?1 AND period_key = ?2",
                )?
                .query_row(params![user_id, period_key], |row| row.get(0))
                .optional()?;
            Ok(used.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn increment_if_below(
        &self,
        user_id: &str,
        counters: &[QuotaCounter],
    ) -> Result<QuotaIncrement> {
        let user_id = user_id.to_string();
        let counters = counters.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for counter in &counters {
                let used: i64 = tx
                    .query_row(
                        "SELECT used FROM quota_counters WHERE user_id = ?1 AND period_key = ?2",
                        params![user_id, counter.period_key],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                if used.max(0) as u64 >= counter.limit {
                    return Ok(QuotaIncrement::LimitReached {
                        period_key: counter.period_key.clone(),
                        used: used.max(0) as u64,
                    });
                }
            }
            let mut used = Vec::with_capacity(counters.len());
            for counter in &counters {
                let value: i64 = tx.query_row(
                    "INSERT INTO quota_counters (user_id, period_key, used) VALUES (?1, ?2, 1)
                     ON CONFLICT(user_id, period_key) DO UPDATE SET used = used + 1
                     RETURNING used",
                    params![user_id, counter.period_key],
                    |row| row.get(0),
                )?;
                used.push(value.max(0) as u64);
            }
            tx.commit()?;
            Ok(QuotaIncrement::Incremented { used })
        })
        .await
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let profile = conn
                .prepare_cached(
                    "SELECT user_id, social, economic, populist FROM user_profiles WHERE user_id = ?1",
                )?
                .query_row([&user_id], |row| {
                    Ok(UserProfile::new(
                        row.get::<_, String>(0)?,
                        ContentVector::new(row.get(1)?, row.get(2)?, row.get(3)?),
                    ))
                })
                .optional()?;
            Ok(profile)
        })
        .await
    }

    async fn put_profile(&self, profile: UserProfile) -> Result<()> {
        self.with_conn(move |conn| {
            let v = profile.vector.clamped();
            conn.execute(
                "INSERT INTO user_profiles (user_id, social, economic, populist)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET social = ?2, economic = ?3, populist = ?4",
                params![profile.user_id, v.social, v.economic, v.populist],
            )?;
            Ok(())
        })
        .await
    }
}
