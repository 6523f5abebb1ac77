//! Knowledge base overview (`fbx stats`) and run history (`fbx history`).

use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::kb::KnowledgeBase;

/// Print totals, per-field breakdowns, top keywords and settings.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let summary = kb.summary().await;
    let content_items = kb.store().count_content_items().await;
    kb.close().await;
    let summary = summary?;
    let content_items = content_items?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Feedback Harness: Knowledge Base Stats");
    println!("=======================================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Opportunities:  {}", summary.total_opportunities);
    println!("  Occurrences:    {}", summary.total_occurrences);
    println!("  Content items:  {}", content_items);

    print_breakdown("By category", &summary.by_category);
    print_breakdown("By severity", &summary.by_severity);
    print_breakdown("By status", &summary.by_status);

    if !summary.top_keywords.is_empty() {
        println!();
        println!("  Top keywords:");
        for (k, n) in &summary.top_keywords {
            println!("    {:<28} {:>6}", k, n);
        }
    }

    if let Some(s) = &summary.settings {
        println!();
        println!("  Settings:");
        println!("    threshold:    {}", s.similarity_threshold);
        println!("    max/input:    {}", s.max_opportunities_per_input);
        println!("    metric:       {}", s.metric);
        println!("    model:        {}", s.embedding_model);
    }
    println!();
    Ok(())
}

fn print_breakdown(label: &str, counts: &BTreeMap<String, usize>) {
    if counts.is_empty() {
        return;
    }
    println!();
    println!("  {}:", label);
    for (k, n) in counts {
        println!("    {:<28} {:>6}", k, n);
    }
}

/// Print the most recent ingestion runs.
pub async fn run_history(config: &Config, limit: i64) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let runs = kb.store().ingest_history(limit).await;
    kb.close().await;
    let runs = runs?;

    if runs.is_empty() {
        println!("No ingestion runs.");
        return Ok(());
    }

    println!(
        "  {:<20} {:<10} {:>6} {:>6} {:>6} {:>6} {:>6}   {}",
        "STARTED", "STATUS", "ITEMS", "NEW", "MERGED", "REJ", "SKIP", "FILE"
    );
    println!("  {}", "-".repeat(90));
    for r in &runs {
        println!(
            "  {:<20} {:<10} {:>6} {:>6} {:>6} {:>6} {:>6}   {}",
            r.started_at.format("%Y-%m-%d %H:%M:%S"),
            r.status,
            r.items,
            r.inserted,
            r.merged,
            r.rejected,
            r.skipped,
            r.file_name
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
