//! JSON Lines ingestion pipeline.
//!
//! Each line pairs one content item with the analyzer's opportunity
//! candidates for it:
//!
//! ```text
//! {"item": {...ContentItem...}, "opportunities": [{...RawOpportunityRecord...}]}
//! ```
//!
//! Flow: parse → record content items → cap candidates per item → embed
//! records that arrived without a vector → validate → skip already-seen
//! content hashes → `KnowledgeBase::ingest`, one candidate at a time.
//!
//! A validation error rejects only that candidate. Persistence and lock
//! errors abort the run. Every run (including failed ones) appends a row
//! to `ingest_log`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use feedback_harness_core::models::{
    Category, ContentItem, RawOpportunity, RawOpportunityRecord, Severity,
};
use feedback_harness_core::KbError;

use crate::config::Config;
use crate::embedding;
use crate::kb::KnowledgeBase;
use crate::sqlite_store::{IngestRun, SqliteStore};

/// One parsed line of an ingest file.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestLine {
    pub item: ContentItem,
    #[serde(default)]
    pub opportunities: Vec<RawOpportunityRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Parse and validate only.
    pub dry_run: bool,
    /// Ingest candidates even if their content hash was seen before.
    pub reingest: bool,
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub items: u64,
    pub candidates: u64,
    pub inserted: u64,
    pub merged: u64,
    pub rejected: u64,
    pub skipped: u64,
    /// Candidates dropped for exceeding `max_opportunities_per_input`.
    pub truncated: u64,
    /// Candidates embedded by the configured provider.
    pub embedded: u64,
}

/// Parse JSON Lines text, skipping blank lines.
pub fn parse_lines(text: &str) -> Result<Vec<IngestLine>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", i + 1))
        })
        .collect()
}

/// `fbx ingest`: ingest one JSONL file and print a summary.
pub async fn run_ingest(config: &Config, path: &Path, opts: IngestOptions) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read ingest file: {}", path.display()))?;
    let file_sha256 = format!("{:x}", Sha256::digest(&bytes));
    let text = String::from_utf8(bytes)
        .with_context(|| format!("Ingest file is not UTF-8: {}", path.display()))?;
    let lines = parse_lines(&text)?;

    let kb = KnowledgeBase::open(config).await?;
    let file_name = path.display().to_string();

    if !opts.dry_run && kb.store().file_already_ingested(&file_sha256).await? {
        tracing::info!(file = %file_name, "file was ingested before; seen candidates will be skipped");
    }

    let started_at = Utc::now();
    let mut report = IngestReport::default();
    let result = ingest_lines(&kb, config, &lines, opts, &mut report).await;

    if !opts.dry_run {
        let run = IngestRun {
            file_name: file_name.clone(),
            file_sha256,
            items: report.items as i64,
            candidates: report.candidates as i64,
            inserted: report.inserted as i64,
            merged: report.merged as i64,
            rejected: report.rejected as i64,
            skipped: report.skipped as i64,
            status: if result.is_ok() { "completed" } else { "failed" }.to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        kb.store().log_ingest_run(&run).await?;
    }

    kb.close().await;
    result?;

    tracing::info!(file = %file_name, ?report, "ingest finished");
    print_report(&file_name, &report, opts.dry_run);
    Ok(())
}

fn print_report(file_name: &str, report: &IngestReport, dry_run: bool) {
    if dry_run {
        println!("ingest {} (dry-run)", file_name);
    } else {
        println!("ingest {}", file_name);
    }
    println!("  items: {}", report.items);
    println!("  candidates: {}", report.candidates);
    if !dry_run {
        println!("  inserted: {}", report.inserted);
        println!("  merged: {}", report.merged);
        println!("  skipped: {}", report.skipped);
    }
    println!("  rejected: {}", report.rejected);
    if report.truncated > 0 {
        println!("  truncated: {}", report.truncated);
    }
    if report.embedded > 0 {
        println!("  embedded: {}", report.embedded);
    }
    println!("ok");
}

/// A candidate waiting to be ingested, tagged with its content item.
struct Pending<'a> {
    item_id: &'a str,
    record: RawOpportunityRecord,
}

/// Run the pipeline over parsed lines, accumulating into `report`.
///
/// `report` is filled in even when this returns an error, so the caller
/// can log how far a failed run got.
pub async fn ingest_lines(
    kb: &KnowledgeBase<SqliteStore>,
    config: &Config,
    lines: &[IngestLine],
    opts: IngestOptions,
    report: &mut IngestReport,
) -> Result<()> {
    let max_per_input = config.dedup.max_opportunities_per_input as usize;
    let mut pending = Vec::new();

    for line in lines {
        report.items += 1;
        if !opts.dry_run {
            kb.store().record_content_item(&line.item).await?;
        }

        let total = line.opportunities.len();
        if total > max_per_input {
            tracing::warn!(
                item = %line.item.id,
                total,
                kept = max_per_input,
                "too many opportunities for one content item, extras dropped"
            );
            report.truncated += (total - max_per_input) as u64;
        }

        for record in line.opportunities.iter().take(max_per_input) {
            report.candidates += 1;
            pending.push(Pending {
                item_id: &line.item.id,
                record: record.clone(),
            });
        }
    }

    if opts.dry_run {
        for p in &pending {
            match precheck(&p.record, config.embedding.is_enabled()) {
                Ok(()) => {
                    if p.record.embedding.is_none() {
                        report.embedded += 1;
                    }
                }
                Err(e) => reject(report, p.item_id, &e),
            }
        }
        return Ok(());
    }

    if config.embedding.is_enabled() {
        fill_missing_embeddings(config, &mut pending, report).await?;
    }

    for p in pending {
        let item_id = p.item_id;
        let raw = match RawOpportunity::try_from(p.record) {
            Ok(raw) => raw,
            Err(e) => {
                reject(report, item_id, &e);
                continue;
            }
        };

        if !opts.reingest && kb.contains_content_hash(&raw.content_hash(item_id)).await? {
            tracing::debug!(item = item_id, title = %raw.title, "already ingested, skipping");
            report.skipped += 1;
            continue;
        }

        match kb.ingest(&raw, item_id).await {
            Ok(outcome) if outcome.merged => report.merged += 1,
            Ok(_) => report.inserted += 1,
            Err(e) if e.is_validation() => reject(report, item_id, &e),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to ingest candidate from {}", item_id))
            }
        }
    }

    Ok(())
}

fn reject(report: &mut IngestReport, item_id: &str, err: &KbError) {
    tracing::warn!(item = item_id, error = %err, "candidate rejected");
    report.rejected += 1;
}

/// Validation available before an embedding exists.
fn precheck(record: &RawOpportunityRecord, can_embed: bool) -> Result<(), KbError> {
    record.category.parse::<Category>()?;
    record.severity.parse::<Severity>()?;
    if record.title.trim().is_empty() {
        return Err(KbError::Validation("title must not be empty".into()));
    }
    match &record.embedding {
        None if !can_embed => Err(KbError::EmptyEmbedding),
        Some(v) if v.is_empty() => Err(KbError::EmptyEmbedding),
        _ => Ok(()),
    }
}

async fn fill_missing_embeddings(
    config: &Config,
    pending: &mut [Pending<'_>],
    report: &mut IngestReport,
) -> Result<()> {
    let missing: Vec<usize> = pending
        .iter()
        .enumerate()
        .filter(|(_, p)| p.record.embedding.is_none())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let texts: Vec<String> = missing
        .iter()
        .map(|&i| pending[i].record.embedding_text())
        .collect();

    tracing::info!(
        count = texts.len(),
        model = provider.model_name(),
        "embedding candidates"
    );
    let vectors = embedding::embed_texts(provider.as_ref(), &config.embedding, &texts)
        .await
        .context("Failed to embed opportunities")?;

    for (i, vector) in missing.into_iter().zip(vectors) {
        pending[i].record.embedding = Some(vector);
        report.embedded += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::db;
    use crate::migrate;
    use feedback_harness_core::search::SearchQuery;
    use tempfile::TempDir;

    async fn setup(extra: &str) -> (TempDir, Config, KnowledgeBase<SqliteStore>) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("data").join("kb.sqlite");
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n{}",
            db_path.display(),
            extra
        ))
        .unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        let kb = KnowledgeBase::from_config(SqliteStore::new(pool), &config.dedup).unwrap();
        (tmp, config, kb)
    }

    fn line(item_id: &str, opportunities: &str) -> String {
        format!(
            r#"{{"item":{{"id":"{}","source_file":"tickets.csv","content_type":"ticket","text":"...","extracted_at":"2024-05-01T10:00:00Z"}},"opportunities":[{}]}}"#,
            item_id, opportunities
        )
    }

    fn opp(title: &str, category: &str, embedding: &str) -> String {
        format!(
            r#"{{"title":"{}","description":"d","category":"{}","severity":"high","keywords":["login"],"embedding":{}}}"#,
            title, category, embedding
        )
    }

    #[test]
    fn test_parse_lines_reports_line_number() {
        let text = format!("{}\n\n{{not json\n", line("t1", ""));
        let err = parse_lines(&text).unwrap_err();
        assert!(err.to_string().contains("line 3"), "{}", err);

        let ok = format!("{}\n\n{}\n", line("t1", ""), line("t2", ""));
        assert_eq!(parse_lines(&ok).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merges_across_items_and_rejects_bad_candidates() {
        let (_tmp, config, kb) = setup("").await;
        let text = [
            line("t1", &opp("Login is slow", "pain_point", "[1.0, 0.0]")),
            line(
                "t2",
                &[
                    opp("Sign-in takes forever", "pain_point", "[0.92, 0.3919]"),
                    opp("Bad", "complaint", "[1.0, 0.0]"),
                    opp("No vector", "pain_point", "null"),
                ]
                .join(","),
            ),
        ]
        .join("\n");
        let lines = parse_lines(&text).unwrap();

        let mut report = IngestReport::default();
        ingest_lines(&kb, &config, &lines, IngestOptions::default(), &mut report)
            .await
            .unwrap();

        assert_eq!(report.items, 2);
        assert_eq!(report.candidates, 4);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected, 2);
        assert_eq!(kb.store().count_content_items().await.unwrap(), 2);

        let hits = kb.search(&SearchQuery::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].opportunity.sources, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_candidates_capped_per_item() {
        let (_tmp, config, kb) = setup("[dedup]\nmax_opportunities_per_input = 2\n").await;
        let opps = [
            opp("A", "pain_point", "[1.0, 0.0, 0.0]"),
            opp("B", "pain_point", "[0.0, 1.0, 0.0]"),
            opp("C", "pain_point", "[0.0, 0.0, 1.0]"),
        ]
        .join(",");
        let lines = parse_lines(&line("t1", &opps)).unwrap();

        let mut report = IngestReport::default();
        ingest_lines(&kb, &config, &lines, IngestOptions::default(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.truncated, 1);
        assert_eq!(report.inserted, 2);
    }

    #[tokio::test]
    async fn test_rerun_skips_seen_candidates_unless_reingest() {
        let (_tmp, config, kb) = setup("").await;
        let lines = parse_lines(&line("t1", &opp("Export crashes", "pain_point", "[0.3, 0.7]"))).unwrap();

        let mut first = IngestReport::default();
        ingest_lines(&kb, &config, &lines, IngestOptions::default(), &mut first)
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);

        let mut second = IngestReport::default();
        ingest_lines(&kb, &config, &lines, IngestOptions::default(), &mut second)
            .await
            .unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.merged, 0);

        let opts = IngestOptions {
            reingest: true,
            ..Default::default()
        };
        let mut third = IngestReport::default();
        ingest_lines(&kb, &config, &lines, opts, &mut third)
            .await
            .unwrap();
        assert_eq!(third.merged, 1);

        let hits = kb.search(&SearchQuery::default()).await.unwrap();
        assert_eq!(hits[0].opportunity.frequency, 2);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (_tmp, config, kb) = setup("").await;
        let opps = [
            opp("Login is slow", "pain_point", "[1.0, 0.0]"),
            opp("Broken", "pain_point", "[]"),
        ]
        .join(",");
        let lines = parse_lines(&line("t1", &opps)).unwrap();

        let opts = IngestOptions {
            dry_run: true,
            ..Default::default()
        };
        let mut report = IngestReport::default();
        ingest_lines(&kb, &config, &lines, opts, &mut report)
            .await
            .unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(kb.summary().await.unwrap().total_opportunities, 0);
        assert_eq!(kb.store().count_content_items().await.unwrap(), 0);
    }
}
