//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate). Timestamps are stored as Unix
//! milliseconds, keywords and sources as JSON arrays, embeddings as
//! little-endian f32 BLOBs.
//!
//! Merges run inside `BEGIN IMMEDIATE`, which takes SQLite's write lock
//! before the candidates are read. Every handle on the same file, in this
//! process or another `fbx` process, is serialized by that lock. A writer
//! that cannot get it within the busy timeout fails with
//! [`KbError::LockTimeout`].
//!
//! Besides the trait, [`SqliteStore`] carries the pipeline-side tables
//! (`content_items`, `ingest_log`) that the core never touches.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use feedback_harness_core::dedup::Resolution;
use feedback_harness_core::embedding::{blob_to_vec, vec_to_blob};
use feedback_harness_core::models::{
    Category, ContentItem, ContentType, KbSettings, Opportunity, ProvenanceRecord, Severity,
    Status,
};
use feedback_harness_core::store::{OpportunityFilter, ResolveFn, Store};
use feedback_harness_core::KbError;

/// Busy timeout assumed when the pool was opened without
/// [`db::connect`](crate::db::connect)'s configured value.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const OPPORTUNITY_COLUMNS: &str = "id, title, description, category, severity, keywords_json, \
     sources_json, frequency, embedding, first_seen, last_seen, status, comments";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    lock_timeout: Duration,
}

/// Filters for [`SqliteStore::list_content_items`].
#[derive(Debug, Clone, Default)]
pub struct ContentItemFilter {
    pub content_type: Option<ContentType>,
    pub customer_id: Option<String>,
    pub source_file: Option<String>,
    pub limit: Option<i64>,
}

/// One row of `ingest_log`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRun {
    pub file_name: String,
    pub file_sha256: String,
    pub items: i64,
    pub candidates: i64,
    pub inserted: i64,
    pub merged: i64,
    pub rejected: i64,
    pub skipped: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// The busy timeout the pool's connections were opened with, reported
    /// in [`KbError::LockTimeout`].
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Map SQLite busy/locked failures to [`KbError::LockTimeout`].
    fn write_error(&self, err: sqlx::Error) -> anyhow::Error {
        if is_busy(&err) {
            KbError::LockTimeout(self.lock_timeout).into()
        } else {
            err.into()
        }
    }

    /// Close the underlying pool. Call once on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Record (or refresh) a content item seen by the ingestion pipeline.
    pub async fn record_content_item(&self, item: &ContentItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_items (id, source_file, content_type, text, extracted_at, customer_id, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_file = excluded.source_file,
                content_type = excluded.content_type,
                text = excluded.text,
                extracted_at = excluded.extracted_at,
                customer_id = excluded.customer_id
            "#,
        )
        .bind(&item.id)
        .bind(&item.source_file)
        .bind(item.content_type.as_str())
        .bind(&item.text)
        .bind(item.extracted_at.timestamp_millis())
        .bind(&item.customer_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recorded content items, most recently recorded first.
    pub async fn list_content_items(&self, filter: &ContentItemFilter) -> Result<Vec<ContentItem>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source_file, content_type, text, extracted_at, customer_id \
             FROM content_items WHERE 1=1",
        );

        if let Some(content_type) = filter.content_type {
            qb.push(" AND content_type = ").push_bind(content_type.as_str());
        }
        if let Some(customer_id) = &filter.customer_id {
            qb.push(" AND customer_id = ").push_bind(customer_id.as_str());
        }
        if let Some(source_file) = &filter.source_file {
            qb.push(" AND source_file = ").push_bind(source_file.as_str());
        }
        qb.push(" ORDER BY recorded_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                let content_type: String = r.get("content_type");
                Ok(ContentItem {
                    id: r.get("id"),
                    source_file: r.get("source_file"),
                    content_type: content_type.parse::<ContentType>()?,
                    text: r.get("text"),
                    extracted_at: from_millis(r.get("extracted_at"))?,
                    customer_id: r.get("customer_id"),
                })
            })
            .collect()
    }

    pub async fn count_content_items(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM content_items")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Append one row to `ingest_log`.
    pub async fn log_ingest_run(&self, run: &IngestRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_log (file_name, file_sha256, items, candidates, inserted, merged,
                                    rejected, skipped, status, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.file_name)
        .bind(&run.file_sha256)
        .bind(run.items)
        .bind(run.candidates)
        .bind(run.inserted)
        .bind(run.merged)
        .bind(run.rejected)
        .bind(run.skipped)
        .bind(&run.status)
        .bind(run.started_at.timestamp_millis())
        .bind(run.finished_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// True if a completed run already ingested a file with this checksum.
    pub async fn file_already_ingested(&self, file_sha256: &str) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM ingest_log WHERE file_sha256 = ? AND status = 'completed'",
        )
        .bind(file_sha256)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Most recent ingestion runs, newest first.
    pub async fn ingest_history(&self, limit: i64) -> Result<Vec<IngestRun>> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, file_sha256, items, candidates, inserted, merged, rejected,
                   skipped, status, started_at, finished_at
            FROM ingest_log
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(IngestRun {
                    file_name: r.get("file_name"),
                    file_sha256: r.get("file_sha256"),
                    items: r.get("items"),
                    candidates: r.get("candidates"),
                    inserted: r.get("inserted"),
                    merged: r.get("merged"),
                    rejected: r.get("rejected"),
                    skipped: r.get("skipped"),
                    status: r.get("status"),
                    started_at: from_millis(r.get("started_at"))?,
                    finished_at: from_millis(r.get("finished_at"))?,
                })
            })
            .collect()
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

async fn fetch_by_category(
    conn: &mut SqliteConnection,
    category: Category,
) -> Result<Vec<Opportunity>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM opportunities WHERE category = ?",
        OPPORTUNITY_COLUMNS
    ))
    .bind(category.as_str())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(row_to_opportunity).collect()
}

/// Upsert the canonical row and append provenance on `conn`.
///
/// The caller owns the transaction. `status` and `comments` are only set on
/// insert; triage edits made by other writers survive a merge.
async fn write_resolution(
    conn: &mut SqliteConnection,
    opportunity: &Opportunity,
    provenance: &ProvenanceRecord,
) -> Result<()> {
    let keywords_json = serde_json::to_string(&opportunity.keywords)?;
    let sources_json = serde_json::to_string(&opportunity.sources)?;
    let blob = vec_to_blob(&opportunity.embedding);

    sqlx::query(
        r#"
        INSERT INTO opportunities (id, title, description, category, severity, severity_rank,
                                   keywords_json, sources_json, frequency, embedding,
                                   first_seen, last_seen, status, comments)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            severity = excluded.severity,
            severity_rank = excluded.severity_rank,
            keywords_json = excluded.keywords_json,
            sources_json = excluded.sources_json,
            frequency = excluded.frequency,
            embedding = excluded.embedding,
            last_seen = excluded.last_seen
        "#,
    )
    .bind(&opportunity.id)
    .bind(&opportunity.title)
    .bind(&opportunity.description)
    .bind(opportunity.category.as_str())
    .bind(opportunity.severity.as_str())
    .bind(opportunity.severity.rank())
    .bind(&keywords_json)
    .bind(&sources_json)
    .bind(i64::from(opportunity.frequency))
    .bind(&blob)
    .bind(opportunity.first_seen.timestamp_millis())
    .bind(opportunity.last_seen.timestamp_millis())
    .bind(opportunity.status.as_str())
    .bind(&opportunity.comments)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO provenance (opportunity_id, content_item_id, title, description,
                                similarity, merged, content_hash, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&provenance.opportunity_id)
    .bind(&provenance.content_item_id)
    .bind(&provenance.title)
    .bind(&provenance.description)
    .bind(provenance.similarity.map(f64::from))
    .bind(provenance.merged as i64)
    .bind(&provenance.content_hash)
    .bind(provenance.recorded_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn row_to_opportunity(row: &SqliteRow) -> Result<Opportunity> {
    let id: String = row.get("id");
    let category: String = row.get("category");
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let keywords_json: String = row.get("keywords_json");
    let sources_json: String = row.get("sources_json");
    let embedding: Vec<u8> = row.get("embedding");
    let frequency: i64 = row.get("frequency");

    Ok(Opportunity {
        title: row.get("title"),
        description: row.get("description"),
        category: category.parse::<Category>()?,
        severity: severity.parse::<Severity>()?,
        keywords: serde_json::from_str(&keywords_json)
            .with_context(|| format!("corrupt keywords for opportunity {}", id))?,
        embedding: blob_to_vec(&embedding),
        sources: serde_json::from_str(&sources_json)
            .with_context(|| format!("corrupt sources for opportunity {}", id))?,
        frequency: u32::try_from(frequency)?,
        first_seen: from_millis(row.get("first_seen"))?,
        last_seen: from_millis(row.get("last_seen"))?,
        status: status.parse::<Status>()?,
        comments: row.get("comments"),
        id,
    })
}

fn row_to_provenance(row: &SqliteRow) -> Result<ProvenanceRecord> {
    let similarity: Option<f64> = row.get("similarity");
    let merged: i64 = row.get("merged");
    Ok(ProvenanceRecord {
        opportunity_id: row.get("opportunity_id"),
        content_item_id: row.get("content_item_id"),
        title: row.get("title"),
        description: row.get("description"),
        similarity: similarity.map(|s| s as f32),
        merged: merged != 0,
        content_hash: row.get("content_hash"),
        recorded_at: from_millis(row.get("recorded_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn resolve_in_category(
        &self,
        category: Category,
        decide: &ResolveFn<'_>,
    ) -> Result<Resolution> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| self.write_error(e))?;

        let outcome = async {
            let candidates = fetch_by_category(&mut conn, category).await?;
            let resolution = decide(&candidates)?;
            write_resolution(&mut conn, &resolution.opportunity, &resolution.provenance).await?;
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|e| self.write_error(e))?;
            Ok::<_, anyhow::Error>(resolution)
        }
        .await;

        if outcome.is_err() && sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
            // never hand a connection with an open transaction back to the pool
            conn.close_on_drop();
        }
        outcome
    }

    async fn get_opportunity(&self, id: &str) -> Result<Option<Opportunity>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM opportunities WHERE id = ?",
            OPPORTUNITY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_opportunity).transpose()
    }

    async fn list_by_category(&self, category: Category) -> Result<Vec<Opportunity>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_category(&mut conn, category).await
    }

    async fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM opportunities WHERE 1=1",
            OPPORTUNITY_COLUMNS
        ));

        if let Some(category) = filter.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(severity) = filter.min_severity {
            qb.push(" AND severity_rank >= ").push_bind(severity.rank());
        }
        if let Some(freq) = filter.min_frequency {
            qb.push(" AND frequency >= ").push_bind(i64::from(freq));
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND last_seen >= ").push_bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            qb.push(" AND first_seen <= ").push_bind(until.timestamp_millis());
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_opportunity).collect()
    }

    async fn provenance(&self, opportunity_id: &str) -> Result<Vec<ProvenanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT opportunity_id, content_item_id, title, description, similarity, merged,
                   content_hash, recorded_at
            FROM provenance
            WHERE opportunity_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(opportunity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_provenance).collect()
    }

    async fn has_content_hash(&self, content_hash: &str) -> Result<bool> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM provenance WHERE content_hash = ?")
                .bind(content_hash)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn update_status(&self, id: &str, status: Status) -> Result<bool> {
        let result = sqlx::query("UPDATE opportunities SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_error(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_comments(&self, id: &str, comments: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE opportunities SET comments = ? WHERE id = ?")
            .bind(comments)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_error(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_settings(&self) -> Result<Option<KbSettings>> {
        let row = sqlx::query(
            r#"
            SELECT similarity_threshold, max_opportunities_per_input, metric, embedding_model, updated_at
            FROM kb_settings WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let threshold: f64 = r.get("similarity_threshold");
            let max_per_input: i64 = r.get("max_opportunities_per_input");
            Ok(KbSettings {
                similarity_threshold: threshold as f32,
                max_opportunities_per_input: u32::try_from(max_per_input)?,
                metric: r.get("metric"),
                embedding_model: r.get("embedding_model"),
                updated_at: from_millis(r.get("updated_at"))?,
            })
        })
        .transpose()
    }

    async fn save_settings(&self, settings: &KbSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kb_settings (id, similarity_threshold, max_opportunities_per_input, metric,
                                     embedding_model, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                similarity_threshold = excluded.similarity_threshold,
                max_opportunities_per_input = excluded.max_opportunities_per_input,
                metric = excluded.metric,
                embedding_model = excluded.embedding_model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(f64::from(settings.similarity_threshold))
        .bind(i64::from(settings.max_opportunities_per_input))
        .bind(&settings.metric)
        .bind(&settings.embedding_model)
        .bind(settings.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| self.write_error(e))?;
        Ok(())
    }
}
