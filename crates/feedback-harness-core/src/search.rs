//! Text search over canonical opportunities.
//!
//! The store applies the structured [`OpportunityFilter`]; this module
//! does the text match and the ranking, so every backend ranks the same
//! way.
//!
//! # Matching
//!
//! Case-insensitive. The whole query as a substring of the title,
//! description or a keyword earns a phrase bonus; each query token found
//! in a field earns token credit. An opportunity with zero credit is not
//! a match. An empty query matches everything with strength `0.0`.
//!
//! # Ranking
//!
//! Severity desc, frequency desc, match strength desc, then first_seen
//! asc and id asc so equal results come back in a stable order.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;

use crate::models::Opportunity;
use crate::store::{OpportunityFilter, Store};

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery<'a> {
    /// Free-text query; empty matches everything.
    pub text: &'a str,
    pub filter: OpportunityFilter,
    /// Maximum number of hits to return.
    pub limit: Option<usize>,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    /// Text-match strength (higher is better, `0.0` for empty queries).
    pub match_score: f64,
}

const TITLE_PHRASE: f64 = 2.0;
const KEYWORD_PHRASE: f64 = 2.0;
const DESCRIPTION_PHRASE: f64 = 1.0;
const TITLE_TOKEN: f64 = 1.0;
const KEYWORD_TOKEN: f64 = 1.0;
const DESCRIPTION_TOKEN: f64 = 0.5;

/// Run a search against a [`Store`] backend.
pub async fn search<S: Store + ?Sized>(store: &S, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>> {
    let candidates = store.list_opportunities(&query.filter).await?;

    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter(|o| query.filter.matches(o))
        .filter_map(|o| {
            text_match_strength(query.text, &o).map(|score| SearchHit {
                opportunity: o,
                match_score: score,
            })
        })
        .collect();

    rank_hits(&mut hits);

    if let Some(limit) = query.limit {
        hits.truncate(limit);
    }

    Ok(hits)
}

/// Sort hits best-first.
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        let (oa, ob) = (&a.opportunity, &b.opportunity);
        ob.severity
            .cmp(&oa.severity)
            .then(ob.frequency.cmp(&oa.frequency))
            .then(
                b.match_score
                    .partial_cmp(&a.match_score)
                    .unwrap_or(Ordering::Equal),
            )
            .then(oa.first_seen.cmp(&ob.first_seen))
            .then(oa.id.cmp(&ob.id))
    });
}

/// Score how well `query` matches `opp`; `None` means no match.
pub fn text_match_strength(query: &str, opp: &Opportunity) -> Option<f64> {
    let phrase = query.trim().to_lowercase();
    if phrase.is_empty() {
        return Some(0.0);
    }

    let title = opp.title.to_lowercase();
    let description = opp.description.to_lowercase();
    let keyword_hit = |needle: &str| opp.keywords.iter().any(|k| k.contains(needle));

    let mut score = 0.0;

    if title.contains(&phrase) {
        score += TITLE_PHRASE;
    }
    if description.contains(&phrase) {
        score += DESCRIPTION_PHRASE;
    }
    if opp.keywords.iter().any(|k| *k == phrase) {
        score += KEYWORD_PHRASE;
    }

    for token in tokenize(&phrase) {
        if title.contains(token.as_str()) {
            score += TITLE_TOKEN;
        } else if keyword_hit(&token) {
            score += KEYWORD_TOKEN;
        } else if description.contains(token.as_str()) {
            score += DESCRIPTION_TOKEN;
        }
    }

    if score > 0.0 {
        Some(score)
    } else {
        None
    }
}

/// Lowercased, punctuation-trimmed, deduplicated query tokens.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
