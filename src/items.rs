//! `fbx items`: content items recorded by the ingestion pipeline.

use anyhow::Result;

use feedback_harness_core::models::ContentItem;

use crate::config::Config;
use crate::kb::KnowledgeBase;
use crate::sqlite_store::ContentItemFilter;

/// Longest text excerpt shown per item in text output.
const EXCERPT_CHARS: usize = 80;

pub async fn run_items(config: &Config, filter: &ContentItemFilter, json: bool) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let items = kb.store().list_content_items(filter).await;
    kb.close().await;
    let items = items?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        print_items(&items);
    }
    Ok(())
}

fn print_items(items: &[ContentItem]) {
    if items.is_empty() {
        println!("No content items.");
        return;
    }

    for item in items {
        println!(
            "{} [{}] {} ({})",
            item.id,
            item.content_type,
            item.source_file,
            item.customer_id.as_deref().unwrap_or("-")
        );
        println!("    {}", excerpt(&item.text));
    }
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", cut)
    }
}
