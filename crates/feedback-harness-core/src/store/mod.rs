//! Storage abstraction for the knowledge base.
//!
//! The [`Store`] trait is the persistence collaborator behind the
//! knowledge base: create/update of canonical opportunities, read by id
//! and by category, filtered listing, and the append-only provenance log.
//! Backends: SQLite (in the app crate) and [`memory::InMemoryStore`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::dedup::Resolution;
use crate::error::KbError;
use crate::models::{Category, KbSettings, Opportunity, ProvenanceRecord, Severity, Status};

/// Merge-or-insert decision over the current same-category canonicals.
///
/// Returning an error aborts the write.
pub type ResolveFn<'a> =
    dyn Fn(&[Opportunity]) -> std::result::Result<Resolution, KbError> + Send + Sync + 'a;

/// Structured filters applied before text matching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityFilter {
    pub category: Option<Category>,
    /// Keep opportunities at or above this severity.
    pub min_severity: Option<Severity>,
    /// Keep opportunities merged at least this many times.
    pub min_frequency: Option<u32>,
    pub status: Option<Status>,
    /// Keep opportunities last seen at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep opportunities first seen at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl OpportunityFilter {
    /// In-process evaluation, used by stores without a query engine.
    pub fn matches(&self, opp: &Opportunity) -> bool {
        self.category.is_none_or(|c| opp.category == c)
            && self.min_severity.is_none_or(|s| opp.severity >= s)
            && self.min_frequency.is_none_or(|f| opp.frequency >= f)
            && self.status.is_none_or(|s| opp.status == s)
            && self.since.is_none_or(|t| opp.last_seen >= t)
            && self.until.is_none_or(|t| opp.first_seen <= t)
    }
}

/// Parse an RFC 3339 timestamp or a `YYYY-MM-DD` date.
///
/// A bare date means the start of that day in UTC, or its last millisecond
/// when `end_of_day` is set, so an upper bound of `2024-05-01` covers the
/// whole day.
pub fn parse_time_bound(
    value: &str,
    end_of_day: bool,
) -> std::result::Result<DateTime<Utc>, KbError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let invalid = || {
        KbError::Validation(format!(
            "expected an RFC 3339 timestamp or a YYYY-MM-DD date, got '{}'",
            value
        ))
    };
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid())?;
    let naive = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .ok_or_else(invalid)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Abstract storage backend for canonical opportunities.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`resolve_in_category`](Store::resolve_in_category) | Read candidates, decide, and write the result as one serialized unit |
/// | [`get_opportunity`](Store::get_opportunity) | Read one opportunity by id |
/// | [`list_by_category`](Store::list_by_category) | Dedup candidates for one category |
/// | [`list_opportunities`](Store::list_opportunities) | Filtered listing for search |
/// | [`provenance`](Store::provenance) | Audit trail for one opportunity |
/// | [`has_content_hash`](Store::has_content_hash) | Whether a raw candidate was already recorded |
/// | [`update_status`](Store::update_status) / [`update_comments`](Store::update_comments) | Triage edits |
/// | [`load_settings`](Store::load_settings) / [`save_settings`](Store::save_settings) | Persisted dedup settings |
#[async_trait]
pub trait Store: Send + Sync {
    /// Run `decide` over the current canonicals in `category` and persist
    /// its result: the opportunity is inserted or updated and the provenance
    /// record appended, both or neither. Triage fields (`status`,
    /// `comments`) of an existing row are left alone.
    ///
    /// The candidate read and the write happen under one backend-level
    /// exclusive lock, so writers in other handles or processes on the same
    /// backend never merge against a stale snapshot. A `decide` error is
    /// returned as a [`KbError`] inside the `anyhow::Error`; a backend that
    /// gives up waiting for its lock returns [`KbError::LockTimeout`] the
    /// same way.
    async fn resolve_in_category(
        &self,
        category: Category,
        decide: &ResolveFn<'_>,
    ) -> Result<Resolution>;

    /// Retrieve a canonical opportunity by id.
    async fn get_opportunity(&self, id: &str) -> Result<Option<Opportunity>>;

    /// All canonical opportunities in `category`, embeddings included.
    async fn list_by_category(&self, category: Category) -> Result<Vec<Opportunity>>;

    /// Opportunities passing `filter`, in no particular order.
    async fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>>;

    /// Provenance records for one opportunity, oldest first.
    async fn provenance(&self, opportunity_id: &str) -> Result<Vec<ProvenanceRecord>>;

    /// True if a provenance record with this content hash exists.
    async fn has_content_hash(&self, content_hash: &str) -> Result<bool>;

    /// Set the triage status. Returns `false` if the id is unknown.
    async fn update_status(&self, id: &str, status: Status) -> Result<bool>;

    /// Replace the comments. Returns `false` if the id is unknown.
    async fn update_comments(&self, id: &str, comments: &str) -> Result<bool>;

    async fn load_settings(&self) -> Result<Option<KbSettings>>;

    async fn save_settings(&self, settings: &KbSettings) -> Result<()>;
}
