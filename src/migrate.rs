//! Database schema migrations (idempotent).
//!
//! | Table | Contents |
//! |-------|----------|
//! | `opportunities` | Canonical opportunities; keywords and sources as JSON, embedding as f32 BLOB |
//! | `provenance` | Append-only links from content items to canonical opportunities |
//! | `kb_settings` | Single row with the dedup settings in effect |
//! | `content_items` | Content items recorded by the ingestion pipeline |
//! | `ingest_log` | One row per `fbx ingest` run |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured database, create all tables, and close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS opportunities (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            severity_rank INTEGER NOT NULL,
            keywords_json TEXT NOT NULL DEFAULT '[]',
            sources_json TEXT NOT NULL,
            frequency INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            comments TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provenance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            opportunity_id TEXT NOT NULL,
            content_item_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            similarity REAL,
            merged INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            FOREIGN KEY (opportunity_id) REFERENCES opportunities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            similarity_threshold REAL NOT NULL,
            max_opportunities_per_input INTEGER NOT NULL,
            metric TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_items (
            id TEXT PRIMARY KEY,
            source_file TEXT NOT NULL,
            content_type TEXT NOT NULL,
            text TEXT NOT NULL,
            extracted_at INTEGER NOT NULL,
            customer_id TEXT,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL,
            file_sha256 TEXT NOT NULL,
            items INTEGER NOT NULL DEFAULT 0,
            candidates INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            merged INTEGER NOT NULL DEFAULT 0,
            rejected INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_opportunities_category ON opportunities(category)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_provenance_opportunity ON provenance(opportunity_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provenance_hash ON provenance(content_hash)")
        .execute(pool)
        .await?;

    Ok(())
}
