//! Aggregate statistics over the canonical opportunities.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::models::{KbSettings, Opportunity};

/// How many keywords [`summarize`] reports.
pub const TOP_KEYWORDS: usize = 10;

/// Knowledge-base overview returned by `stats` and `GET /stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KbSummary {
    pub total_opportunities: usize,
    /// Sum of frequencies: raw candidates folded into the canonical set.
    pub total_occurrences: u64,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// Most common keywords across canonical opportunities, count desc.
    pub top_keywords: Vec<(String, usize)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<KbSettings>,
}

/// Build a [`KbSummary`] from a full listing.
pub fn summarize(opportunities: &[Opportunity], settings: Option<KbSettings>) -> KbSummary {
    let mut summary = KbSummary {
        total_opportunities: opportunities.len(),
        settings,
        ..Default::default()
    };

    let mut keyword_counts: HashMap<&str, usize> = HashMap::new();

    for o in opportunities {
        summary.total_occurrences += u64::from(o.frequency);
        *summary
            .by_category
            .entry(o.category.as_str().to_string())
            .or_default() += 1;
        *summary
            .by_severity
            .entry(o.severity.as_str().to_string())
            .or_default() += 1;
        *summary
            .by_status
            .entry(o.status.as_str().to_string())
            .or_default() += 1;
        for k in &o.keywords {
            *keyword_counts.entry(k.as_str()).or_default() += 1;
        }
    }

    let mut top: Vec<(String, usize)> = keyword_counts
        .into_iter()
        .map(|(k, n)| (k.to_string(), n))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top.truncate(TOP_KEYWORDS);
    summary.top_keywords = top;

    summary
}
