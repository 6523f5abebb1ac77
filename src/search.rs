//! `fbx search`: ranked listing of canonical opportunities.

use anyhow::Result;
use chrono::{DateTime, Utc};

use feedback_harness_core::models::{Category, Severity, Status};
use feedback_harness_core::search::{SearchHit, SearchQuery};
use feedback_harness_core::store::OpportunityFilter;

use crate::config::Config;
use crate::kb::KnowledgeBase;

/// Filters and output options for one search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub category: Option<Category>,
    pub min_severity: Option<Severity>,
    pub min_frequency: Option<u32>,
    pub status: Option<Status>,
    /// Only opportunities still being reported at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only opportunities first reported at or before this instant.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Print hits as a JSON array instead of text.
    pub json: bool,
}

impl SearchOptions {
    pub fn filter(&self) -> OpportunityFilter {
        OpportunityFilter {
            category: self.category,
            min_severity: self.min_severity,
            min_frequency: self.min_frequency,
            status: self.status,
            since: self.since,
            until: self.until,
        }
    }
}

pub async fn run_search(config: &Config, query: &str, opts: &SearchOptions) -> Result<()> {
    let kb = KnowledgeBase::open(config).await?;
    let hits = kb
        .search(&SearchQuery {
            text: query,
            filter: opts.filter(),
            limit: opts.limit,
        })
        .await;
    kb.close().await;
    let hits = hits?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        print_hits(&hits);
    }
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in hits.iter().enumerate() {
        let o = &hit.opportunity;
        println!(
            "{}. [{} x{}] {} / {}",
            i + 1,
            o.severity,
            o.frequency,
            o.category,
            o.title
        );
        println!("    status: {}", o.status);
        if !o.keywords.is_empty() {
            println!("    keywords: {}", o.keywords.join(", "));
        }
        println!(
            "    seen: {} .. {}",
            o.first_seen.format("%Y-%m-%d"),
            o.last_seen.format("%Y-%m-%d")
        );
        println!("    id: {}", o.id);
        println!();
    }
}
