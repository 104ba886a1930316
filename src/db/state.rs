//! Runtime state tracking: clean start/shutdown detection and instance identity.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN: &str = "clean_shutdown";
const INSTANCE_ID: &str = "instance_id";

impl Database {
    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read runtime state '{}': {}",
                    key, e
                )))
            })
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write runtime state '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.get_state(CLEAN_SHUTDOWN).await?;
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that this process instance has started
    ///
    /// Records `instance_id` and returns the id of the previous instance, if
    /// any. Until set_clean_shutdown() is called, was_unclean_shutdown()
    /// returns true.
    pub async fn set_clean_start(&self, instance_id: &str) -> Result<Option<String>> {
        let previous = self.get_state(INSTANCE_ID).await?;
        self.set_state(INSTANCE_ID, instance_id).await?;
        self.set_state(CLEAN_SHUTDOWN, "false").await?;
        Ok(previous)
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_state(CLEAN_SHUTDOWN, "true").await
    }
}
