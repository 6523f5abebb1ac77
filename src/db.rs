//! SQLite database connection management.
//!
//! The knowledge base is an explicit handle, never ambient state: each
//! process opens a pool here, passes it into a
//! [`SqliteStore`](crate::sqlite_store::SqliteStore), and closes it on
//! shutdown. The database file and its parent directories are created on
//! first use.
//!
//! WAL mode lets HTTP readers run while an ingestion run writes. Writers
//! from other handles wait up to `[dedup].lock_timeout_ms` for SQLite's
//! write lock before giving up.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

/// Create a connection pool to the configured SQLite database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(config.dedup.lock_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    Ok(pool)
}
