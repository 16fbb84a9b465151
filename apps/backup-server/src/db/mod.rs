//! Database module for SQLite persistence
//!
//! Handles backup records, per-file records, client credentials and the
//! audit log.

mod backups;
mod clients;
mod schema;

pub use backups::*;
pub use clients::*;
pub use schema::*;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Create a new database connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let in_memory = config.url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to `:memory:` is its own database, so keep exactly one alive.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };

    let pool = pool_options.connect_with(options).await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}
