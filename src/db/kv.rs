//! Expiring key-value entries backing the result cache and registry snapshots.

use crate::error::DatabaseError;
use crate::store::KeyValueStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::Database;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

impl Database {
    /// Fetch a live entry; rows past their expiry read as absent
    pub async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read key '{}': {}",
                    key, e
                )))
            })
    }

    /// Insert or replace an entry
    pub async fn kv_set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write key '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Remove an entry
    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete key '{}': {}",
                    key, e
                )))
            })?;

        Ok(())
    }

    /// Delete every expired row, returning how many were removed
    pub async fn kv_purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to purge expired entries: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Number of stored rows, expired or not
    pub async fn kv_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM kv_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count entries: {}",
                    e
                )))
            })
    }
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.kv_get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.kv_set(key, &value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv_delete(key).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.kv_purge_expired().await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
