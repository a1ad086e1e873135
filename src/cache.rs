//! Cached API reads served while offline.
//!
//! Kept apart from the mutation queue: clearing it never drops a user write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub value: Value,
    pub fetched_at: i64,
}

impl CachedEntry {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.fetched_at).max(0)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.value.clone()).map_err(|err| {
            AppError::new("CACHE/DECODE_FAILED", "Cached value has an unexpected shape")
                .with_cause(err)
        })
    }
}

#[derive(Clone, Debug)]
pub struct ReadCache {
    pool: SqlitePool,
}

impl ReadCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> AppResult<()> {
        let json = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO read_cache (key, value, fetched_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, fetched_at = excluded.fetched_at",
        )
        .bind(key)
        .bind(json)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::new("CACHE/WRITE_FAILED", "Failed to cache value")
                .with_context("key", key)
                .with_cause(err)
        })?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<CachedEntry>> {
        let row = sqlx::query("SELECT value, fetched_at FROM read_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                AppError::new("CACHE/READ_FAILED", "Failed to read cache")
                    .with_context("key", key)
                    .with_cause(err)
            })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("value")?;
        Ok(Some(CachedEntry {
            value: serde_json::from_str(&raw)?,
            fetched_at: row.try_get("fetched_at")?,
        }))
    }

    pub async fn remove(&self, key: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM read_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|err| AppError::new("CACHE/WRITE_FAILED", "Failed to remove cache entry").with_cause(err))?;
        Ok(res.rows_affected() > 0)
    }

    /// Drops every cached read. Returns the number of entries removed.
    pub async fn clear(&self) -> AppResult<u64> {
        let res = sqlx::query("DELETE FROM read_cache")
            .execute(&self.pool)
            .await
            .map_err(|err| AppError::new("CACHE/WRITE_FAILED", "Failed to clear cache").with_cause(err))?;
        let removed = res.rows_affected();
        tracing::info!(target: "fieldsync", event = "cache_cleared", removed);
        Ok(removed)
    }
}
