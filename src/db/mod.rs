//! Database layer for media-dl
//!
//! SQLite persistence behind the [`KeyValueStore`](crate::store::KeyValueStore)
//! boundary, used by the result cache and the job registry to survive
//! restarts.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`kv`] - Expiring key-value entries
//! - [`state`] - Runtime state (shutdown tracking)

use sqlx::sqlite::SqlitePool;

mod kv;
mod migrations;
mod state;

/// Database handle for media-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
