//! Core data models used throughout Feedback Harness.
//!
//! Content items arrive from the extraction pipeline, raw opportunities
//! from the AI analyzer, and canonical [`Opportunity`] records are what
//! the knowledge base keeps after deduplication.
//!
//! Category, severity, status and content type are closed enums. String
//! input is parsed with [`FromStr`], which rejects anything outside the
//! enumeration with the matching [`KbError`] variant.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KbError;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// What kind of signal an opportunity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    PainPoint,
    ImprovementOpportunity,
    FeatureRequest,
}

impl Category {
    pub const ALL: [Self; 3] = [
        Self::PainPoint,
        Self::ImprovementOpportunity,
        Self::FeatureRequest,
    ];

    /// Return the string representation used in SQL storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PainPoint => "pain_point",
            Self::ImprovementOpportunity => "improvement_opportunity",
            Self::FeatureRequest => "feature_request",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| KbError::InvalidCategory(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Impact level, ordered `low < medium < high < critical`.
///
/// The derived `Ord` follows declaration order, so `max` picks the more
/// severe of two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank (1..=4), stored alongside the label so SQL can filter
    /// and order by severity.
    #[must_use]
    pub const fn rank(self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| KbError::InvalidSeverity(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Triage state of a canonical opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    New,
    InProgress,
    Blocked,
    Solved,
    Discarded,
}

impl Status {
    pub const ALL: [Self; 5] = [
        Self::New,
        Self::InProgress,
        Self::Blocked,
        Self::Solved,
        Self::Discarded,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Solved => "solved",
            Self::Discarded => "discarded",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| KbError::InvalidStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ContentType
// ---------------------------------------------------------------------------

/// Kind of raw input a content item was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Conversation,
    Ticket,
    Suggestion,
}

impl ContentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Ticket => "ticket",
            Self::Suggestion => "suggestion",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "conversation" => Ok(Self::Conversation),
            "ticket" => Ok(Self::Ticket),
            "suggestion" => Ok(Self::Suggestion),
            other => Err(KbError::Validation(format!(
                "unknown content type '{}' (expected conversation, ticket, or suggestion)",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One unit of raw input: a conversation turn, a ticket, or a suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub source_file: String,
    pub content_type: ContentType,
    pub text: String,
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// Analyzer output as it arrives on the wire, before validation.
///
/// Category and severity are still free-form strings here; converting to
/// [`RawOpportunity`] rejects values outside the enumerations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOpportunityRecord {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub severity: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl RawOpportunityRecord {
    /// Text fed to the embedding provider when no vector was supplied.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

/// A validated opportunity candidate extracted from one content item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOpportunity {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub severity: Severity,
    pub keywords: Vec<String>,
    pub embedding: Vec<f32>,
}

impl RawOpportunity {
    /// Check the invariants [`crate::dedup`] relies on.
    ///
    /// Fails with `EmptyEmbedding` when no vector is present and with
    /// `InvalidEmbedding` when any component is NaN or infinite.
    pub fn validate(&self) -> Result<(), KbError> {
        if self.title.trim().is_empty() {
            return Err(KbError::Validation("title must not be empty".into()));
        }
        if self.embedding.is_empty() {
            return Err(KbError::EmptyEmbedding);
        }
        if let Some(pos) = self.embedding.iter().position(|v| !v.is_finite()) {
            return Err(KbError::InvalidEmbedding(format!(
                "component {} is not a finite number",
                pos
            )));
        }
        Ok(())
    }

    /// SHA-256 over the fields that identify one analyzer output.
    ///
    /// Callers use this to skip candidates they already ingested; the
    /// store itself never deduplicates on it.
    pub fn content_hash(&self, content_item_id: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [
            content_item_id,
            self.category.as_str(),
            self.title.trim(),
            self.description.trim(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl TryFrom<RawOpportunityRecord> for RawOpportunity {
    type Error = KbError;

    fn try_from(rec: RawOpportunityRecord) -> Result<Self, Self::Error> {
        let category: Category = rec.category.parse()?;
        let severity: Severity = rec.severity.parse()?;
        let embedding = rec.embedding.unwrap_or_default();
        let raw = RawOpportunity {
            title: rec.title.trim().to_string(),
            description: rec.description.trim().to_string(),
            category,
            severity,
            keywords: normalize_keywords(&rec.keywords),
            embedding,
        };
        raw.validate()?;
        Ok(raw)
    }
}

/// A deduplicated opportunity owning the merged keywords and provenance
/// of every raw candidate folded into it.
///
/// Invariant: `sources` is never empty and `frequency == sources.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub severity: Severity,
    pub keywords: Vec<String>,
    /// Running centroid of every merged embedding.
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
    /// Content item ids, one per merged occurrence, in merge order.
    pub sources: Vec<String>,
    pub frequency: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub comments: String,
}

impl Opportunity {
    /// True when the source list and frequency agree.
    pub fn is_consistent(&self) -> bool {
        !self.sources.is_empty() && self.frequency as usize == self.sources.len()
    }
}

/// Append-only audit link from a source content item to the canonical
/// opportunity it was inserted as or merged into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub opportunity_id: String,
    pub content_item_id: String,
    pub title: String,
    pub description: String,
    /// Similarity to the canonical opportunity at merge time; `None` for
    /// the record that created it.
    pub similarity: Option<f32>,
    pub merged: bool,
    pub content_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted dedup settings, written by `init` and shown by `stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbSettings {
    pub similarity_threshold: f32,
    pub max_opportunities_per_input: u32,
    pub metric: String,
    pub embedding_model: String,
    pub updated_at: DateTime<Utc>,
}

/// Result of ingesting one raw opportunity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    /// Canonical opportunity id (new or merged-into).
    pub id: String,
    pub merged: bool,
    /// Score against the chosen canonical opportunity, when merged.
    pub similarity: Option<f32>,
}

/// Trim, lowercase, drop empties, and deduplicate keywords.
///
/// Output is sorted so that keyword sets compare equal regardless of the
/// order the analyzer produced them in.
pub fn normalize_keywords<S: AsRef<str>>(keywords: &[S]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.as_ref().trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(category: &str, severity: &str, embedding: Option<Vec<f32>>) -> RawOpportunityRecord {
        RawOpportunityRecord {
            title: "Login fails".into(),
            description: "Users cannot log in after the update".into(),
            category: category.into(),
            severity: severity.into(),
            keywords: vec!["Login".into(), " login ".into(), "timeout".into()],
            embedding,
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::High.max(Severity::Low), Severity::High);
    }

    #[test]
    fn test_enum_parse_rejects_unknown() {
        assert!(matches!(
            "bug".parse::<Category>(),
            Err(KbError::InvalidCategory(s)) if s == "bug"
        ));
        assert!(matches!(
            "urgent".parse::<Severity>(),
            Err(KbError::InvalidSeverity(_))
        ));
        assert!(matches!(
            "nueva".parse::<Status>(),
            Err(KbError::InvalidStatus(_))
        ));
        assert_eq!(
            "feature_request".parse::<Category>().unwrap(),
            Category::FeatureRequest
        );
    }

    #[test]
    fn test_try_from_record_normalizes_keywords() {
        let raw = RawOpportunity::try_from(record("pain_point", "high", Some(vec![1.0, 0.0])))
            .unwrap();
        assert_eq!(raw.keywords, vec!["login", "timeout"]);
        assert_eq!(raw.category, Category::PainPoint);
        assert_eq!(raw.severity, Severity::High);
    }

    #[test]
    fn test_try_from_record_requires_embedding() {
        let err = RawOpportunity::try_from(record("pain_point", "high", None)).unwrap_err();
        assert!(matches!(err, KbError::EmptyEmbedding));

        let err = RawOpportunity::try_from(record("pain_point", "high", Some(vec![]))).unwrap_err();
        assert!(matches!(err, KbError::EmptyEmbedding));
    }

    #[test]
    fn test_try_from_record_checks_category_before_embedding() {
        let err = RawOpportunity::try_from(record("complaint", "high", None)).unwrap_err();
        assert!(matches!(err, KbError::InvalidCategory(_)));
    }

    #[test]
    fn test_non_finite_embedding_rejected() {
        let err = RawOpportunity::try_from(record("pain_point", "low", Some(vec![1.0, f32::NAN])))
            .unwrap_err();
        assert!(matches!(err, KbError::InvalidEmbedding(_)));
    }

    #[test]
    fn test_content_hash_stable_and_distinct() {
        let raw = RawOpportunity::try_from(record("pain_point", "high", Some(vec![1.0]))).unwrap();
        assert_eq!(raw.content_hash("item-1"), raw.content_hash("item-1"));
        assert_ne!(raw.content_hash("item-1"), raw.content_hash("item-2"));
        assert_eq!(raw.content_hash("item-1").len(), 64);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Category::ImprovementOpportunity).unwrap();
        assert_eq!(json, "\"improvement_opportunity\"");
        let status: Status = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, Status::InProgress);
    }
}
