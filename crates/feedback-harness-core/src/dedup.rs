//! Duplicate detection and merge for raw opportunities.
//!
//! Pure decision logic with no locking or I/O. The app's `KnowledgeBase`
//! loads the same-category candidates, calls [`resolve`] while holding
//! the writer lock, and persists the returned [`Resolution`] atomically.
//!
//! # Decision
//!
//! 1. Only canonical opportunities in the raw candidate's category are
//!    compared (no cross-category merges).
//! 2. Each is scored with the configured [`Similarity`].
//! 3. Scores `>= threshold` qualify. The highest score wins; exact ties
//!    go to the earliest `first_seen`, then the smallest id.
//! 4. No qualifying candidate → insert a new canonical opportunity.
//!
//! # Merge effect
//!
//! Severity becomes the max of both, keywords are unioned, the source id
//! is appended, `frequency += 1`, `last_seen` moves to now, and the
//! embedding becomes the running mean of every merged vector. Title,
//! description, status and comments of the canonical record are kept.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::embedding::{update_centroid, Similarity};
use crate::error::KbError;
use crate::models::{normalize_keywords, Opportunity, ProvenanceRecord, RawOpportunity, Status};

/// Default minimum similarity for two opportunities to count as duplicates.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

/// Threshold policy for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    threshold: f32,
}

impl DedupPolicy {
    /// Build a policy, rejecting thresholds outside `(0, 1]`.
    pub fn new(threshold: f32) -> Result<Self, KbError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(KbError::Validation(format!(
                "similarity threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// The canonical opportunity a raw candidate should merge into.
#[derive(Debug, Clone, Copy)]
pub struct Match<'a> {
    pub opportunity: &'a Opportunity,
    pub score: f32,
}

/// What to persist for one ingested raw opportunity.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The created or updated canonical opportunity.
    pub opportunity: Opportunity,
    /// Audit link for this ingestion.
    pub provenance: ProvenanceRecord,
    pub merged: bool,
    pub similarity: Option<f32>,
}

/// Find the best same-category candidate at or above the threshold.
pub fn best_match<'a, S: Similarity + ?Sized>(
    raw: &RawOpportunity,
    candidates: &'a [Opportunity],
    similarity: &S,
    policy: &DedupPolicy,
) -> Option<Match<'a>> {
    candidates
        .iter()
        .filter(|c| c.category == raw.category)
        .map(|c| Match {
            opportunity: c,
            score: similarity.score(&raw.embedding, &c.embedding),
        })
        .filter(|m| m.score >= policy.threshold())
        .min_by(rank_matches)
}

/// Orders matches best-first: score desc, first_seen asc, id asc.
fn rank_matches(a: &Match<'_>, b: &Match<'_>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.opportunity.first_seen.cmp(&b.opportunity.first_seen))
        .then(a.opportunity.id.cmp(&b.opportunity.id))
}

/// Decide merge-or-insert for `raw` and build the records to persist.
///
/// `new_id` is only called when a new canonical opportunity is created.
/// Validation runs first, so an error here means nothing should be
/// written.
pub fn resolve<S: Similarity + ?Sized>(
    raw: &RawOpportunity,
    source_content_item_id: &str,
    candidates: &[Opportunity],
    similarity: &S,
    policy: &DedupPolicy,
    new_id: impl FnOnce() -> String,
    now: DateTime<Utc>,
) -> Result<Resolution, KbError> {
    raw.validate()?;
    if source_content_item_id.trim().is_empty() {
        return Err(KbError::Validation(
            "source content item id must not be empty".into(),
        ));
    }

    let content_hash = raw.content_hash(source_content_item_id);

    let (opportunity, merged, score) = match best_match(raw, candidates, similarity, policy) {
        Some(m) => (
            merge_into(m.opportunity, raw, source_content_item_id, now),
            true,
            Some(m.score),
        ),
        None => (
            new_opportunity(new_id(), raw, source_content_item_id, now),
            false,
            None,
        ),
    };

    debug_assert!(opportunity.is_consistent());

    let provenance = ProvenanceRecord {
        opportunity_id: opportunity.id.clone(),
        content_item_id: source_content_item_id.to_string(),
        title: raw.title.clone(),
        description: raw.description.clone(),
        similarity: score,
        merged,
        content_hash,
        recorded_at: now,
    };

    Ok(Resolution {
        opportunity,
        provenance,
        merged,
        similarity: score,
    })
}

/// Create a canonical opportunity from a single raw candidate.
pub fn new_opportunity(
    id: String,
    raw: &RawOpportunity,
    source_content_item_id: &str,
    now: DateTime<Utc>,
) -> Opportunity {
    Opportunity {
        id,
        title: raw.title.clone(),
        description: raw.description.clone(),
        category: raw.category,
        severity: raw.severity,
        keywords: normalize_keywords(&raw.keywords),
        embedding: raw.embedding.clone(),
        sources: vec![source_content_item_id.to_string()],
        frequency: 1,
        first_seen: now,
        last_seen: now,
        status: Status::New,
        comments: String::new(),
    }
}

/// Fold `raw` into a copy of `target`.
pub fn merge_into(
    target: &Opportunity,
    raw: &RawOpportunity,
    source_content_item_id: &str,
    now: DateTime<Utc>,
) -> Opportunity {
    let mut merged = target.clone();

    merged.severity = target.severity.max(raw.severity);

    let mut keywords = target.keywords.clone();
    keywords.extend(raw.keywords.iter().cloned());
    merged.keywords = normalize_keywords(&keywords);

    merged.embedding = update_centroid(&target.embedding, target.frequency, &raw.embedding);
    merged.sources.push(source_content_item_id.to_string());
    merged.frequency = target.frequency + 1;
    merged.last_seen = now.max(target.last_seen);

    merged
}
