//! The knowledge base service: deduplicating ingestion plus reads.
//!
//! [`KnowledgeBase`] wraps a [`Store`] backend with the single-writer
//! discipline the dedup decision needs. Writers (`ingest`, `set_status`,
//! `set_comments`, `record_settings`) take an exclusive guard with a bounded
//! wait; readers take a shared guard and run concurrently with each other.
//! The guard only orders callers sharing this handle. Handles in other
//! processes are serialized by the store, which runs each merge-or-insert
//! under its own exclusive lock.
//!
//! ```text
//! ingest(raw, source)
//!   ├─ validate (no lock held)
//!   ├─ acquire writer guard within lock_timeout ── timeout → LockTimeout
//!   └─ store.resolve_in_category (store lock held) ── busy → LockTimeout
//!        ├─ read same-category candidates
//!        ├─ dedup::resolve → merge into best match or insert new
//!        └─ write opportunity + provenance
//! ```
//!
//! Embedding calls never happen here; callers supply the vector.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use feedback_harness_core::dedup::{self, DedupPolicy};
use feedback_harness_core::embedding::{Cosine, Similarity};
use feedback_harness_core::models::{
    IngestOutcome, KbSettings, Opportunity, ProvenanceRecord, RawOpportunity, Status,
};
use feedback_harness_core::search::{self, SearchHit, SearchQuery};
use feedback_harness_core::store::{OpportunityFilter, Store};
use feedback_harness_core::summary::{self, KbSummary};
use feedback_harness_core::KbError;

use crate::config::{Config, DedupConfig};
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Deduplicating opportunity store over a persistence backend.
pub struct KnowledgeBase<S: Store, M: Similarity = Cosine> {
    store: S,
    similarity: M,
    policy: DedupPolicy,
    lock: RwLock<()>,
    lock_timeout: Duration,
}

impl<S: Store> KnowledgeBase<S, Cosine> {
    /// Cosine similarity with the given policy.
    pub fn new(store: S, policy: DedupPolicy, lock_timeout: Duration) -> Self {
        Self::with_similarity(store, Cosine, policy, lock_timeout)
    }

    /// Build from the `[dedup]` config section.
    pub fn from_config(store: S, dedup: &DedupConfig) -> Result<Self, KbError> {
        let policy = DedupPolicy::new(dedup.similarity_threshold)?;
        Ok(Self::new(store, policy, dedup.lock_timeout()))
    }
}

impl<S: Store, M: Similarity> KnowledgeBase<S, M> {
    pub fn with_similarity(
        store: S,
        similarity: M,
        policy: DedupPolicy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            similarity,
            policy,
            lock: RwLock::new(()),
            lock_timeout,
        }
    }

    /// Direct access to the backend, for pipeline-side bookkeeping.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn write_guard(&self) -> Result<RwLockWriteGuard<'_, ()>, KbError> {
        tokio::time::timeout(self.lock_timeout, self.lock.write())
            .await
            .map_err(|_| KbError::LockTimeout(self.lock_timeout))
    }

    async fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Merge `raw` into its best same-category duplicate, or insert it.
    ///
    /// Nothing is written when this returns an error.
    pub async fn ingest(
        &self,
        raw: &RawOpportunity,
        source_content_item_id: &str,
    ) -> Result<IngestOutcome, KbError> {
        raw.validate()?;
        if source_content_item_id.trim().is_empty() {
            return Err(KbError::Validation(
                "source content item id must not be empty".into(),
            ));
        }

        let _guard = self.write_guard().await?;

        let now = now_millis();
        let decide = |candidates: &[Opportunity]| {
            dedup::resolve(
                raw,
                source_content_item_id,
                candidates,
                &self.similarity,
                &self.policy,
                || Uuid::new_v4().to_string(),
                now,
            )
        };
        let resolution = self
            .store
            .resolve_in_category(raw.category, &decide)
            .await
            .map_err(store_error)?;

        if resolution.merged {
            tracing::debug!(
                id = %resolution.opportunity.id,
                source = source_content_item_id,
                similarity = resolution.similarity.unwrap_or_default(),
                frequency = resolution.opportunity.frequency,
                "merged into existing opportunity"
            );
        } else {
            tracing::debug!(
                id = %resolution.opportunity.id,
                source = source_content_item_id,
                "inserted new opportunity"
            );
        }

        Ok(IngestOutcome {
            id: resolution.opportunity.id,
            merged: resolution.merged,
            similarity: resolution.similarity,
        })
    }

    pub async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>, KbError> {
        let _guard = self.read_guard().await;
        search::search(&self.store, query)
            .await
            .map_err(store_error)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Opportunity, KbError> {
        let _guard = self.read_guard().await;
        self.store
            .get_opportunity(id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| KbError::NotFound(id.to_string()))
    }

    /// Provenance records for `id`, oldest first.
    pub async fn provenance(&self, id: &str) -> Result<Vec<ProvenanceRecord>, KbError> {
        let _guard = self.read_guard().await;
        let exists = self
            .store
            .get_opportunity(id)
            .await
            .map_err(store_error)?
            .is_some();
        if !exists {
            return Err(KbError::NotFound(id.to_string()));
        }
        self.store
            .provenance(id)
            .await
            .map_err(store_error)
    }

    /// Whether a raw candidate with this content hash was already recorded.
    pub async fn contains_content_hash(&self, content_hash: &str) -> Result<bool, KbError> {
        let _guard = self.read_guard().await;
        self.store
            .has_content_hash(content_hash)
            .await
            .map_err(store_error)
    }

    pub async fn set_status(&self, id: &str, status: Status) -> Result<(), KbError> {
        let _guard = self.write_guard().await?;
        let updated = self
            .store
            .update_status(id, status)
            .await
            .map_err(store_error)?;
        if !updated {
            return Err(KbError::NotFound(id.to_string()));
        }
        tracing::info!(id, status = %status, "status updated");
        Ok(())
    }

    /// Parse `status` and apply it; unknown names fail with `InvalidStatus`.
    pub async fn set_status_str(&self, id: &str, status: &str) -> Result<Status, KbError> {
        let status: Status = status.parse()?;
        self.set_status(id, status).await?;
        Ok(status)
    }

    pub async fn set_comments(&self, id: &str, comments: &str) -> Result<(), KbError> {
        let _guard = self.write_guard().await?;
        let updated = self
            .store
            .update_comments(id, comments)
            .await
            .map_err(store_error)?;
        if !updated {
            return Err(KbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn settings(&self) -> Result<Option<KbSettings>, KbError> {
        let _guard = self.read_guard().await;
        self.store
            .load_settings()
            .await
            .map_err(store_error)
    }

    /// Persist the settings this knowledge base runs with.
    pub async fn record_settings(
        &self,
        max_opportunities_per_input: u32,
        embedding_model: &str,
    ) -> Result<KbSettings, KbError> {
        let settings = KbSettings {
            similarity_threshold: self.policy.threshold(),
            max_opportunities_per_input,
            metric: self.similarity.name().to_string(),
            embedding_model: embedding_model.to_string(),
            updated_at: now_millis(),
        };
        let _guard = self.write_guard().await?;
        self.store
            .save_settings(&settings)
            .await
            .map_err(store_error)?;
        Ok(settings)
    }

    pub async fn summary(&self) -> Result<KbSummary, KbError> {
        let _guard = self.read_guard().await;
        let all = self
            .store
            .list_opportunities(&OpportunityFilter::default())
            .await
            .map_err(store_error)?;
        let settings = self
            .store
            .load_settings()
            .await
            .map_err(store_error)?;
        Ok(summary::summarize(&all, settings))
    }
}

impl KnowledgeBase<SqliteStore> {
    /// Open the configured SQLite knowledge base. Run `fbx init` first.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        let store = SqliteStore::new(pool).with_lock_timeout(config.dedup.lock_timeout());
        Ok(Self::from_config(store, &config.dedup)?)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

/// Surface a [`KbError`] raised inside the store as itself; anything else
/// is a persistence failure.
fn store_error(err: anyhow::Error) -> KbError {
    match err.downcast::<KbError>() {
        Ok(err) => err,
        Err(err) => KbError::Persistence(err),
    }
}

/// Current time at millisecond precision, matching what SQLite stores.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use feedback_harness_core::models::{Category, KbSettings, Severity};
    use feedback_harness_core::dedup::Resolution;
    use feedback_harness_core::store::memory::InMemoryStore;
    use feedback_harness_core::store::ResolveFn;
    use std::sync::Arc;

    fn kb() -> KnowledgeBase<InMemoryStore> {
        KnowledgeBase::new(
            InMemoryStore::new(),
            DedupPolicy::default(),
            Duration::from_millis(200),
        )
    }

    fn raw(
        title: &str,
        category: Category,
        severity: Severity,
        keywords: &[&str],
        embedding: Vec<f32>,
    ) -> RawOpportunity {
        RawOpportunity {
            title: title.into(),
            description: format!("{} (reported by a customer)", title),
            category,
            severity,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            embedding,
        }
    }

    /// Unit vector at cosine `s` from `[1, 0]`.
    fn at_similarity(s: f32) -> Vec<f32> {
        vec![s, (1.0 - s * s).sqrt()]
    }

    #[tokio::test]
    async fn test_login_scenario_merges_and_cross_category_does_not() {
        let kb = kb();

        let a = kb
            .ingest(
                &raw(
                    "Login is slow",
                    Category::PainPoint,
                    Severity::High,
                    &["login", "performance"],
                    vec![1.0, 0.0],
                ),
                "ticket-1",
            )
            .await
            .unwrap();
        assert!(!a.merged);
        assert_eq!(a.similarity, None);

        let b = kb
            .ingest(
                &raw(
                    "Signing in takes forever",
                    Category::PainPoint,
                    Severity::Medium,
                    &["login", "latency"],
                    at_similarity(0.92),
                ),
                "conversation-7",
            )
            .await
            .unwrap();
        assert!(b.merged);
        assert_eq!(b.id, a.id);
        assert!((b.similarity.unwrap() - 0.92).abs() < 1e-4);

        let c = kb
            .ingest(
                &raw(
                    "Faster login",
                    Category::FeatureRequest,
                    Severity::Low,
                    &["login"],
                    vec![1.0, 0.0],
                ),
                "suggestion-3",
            )
            .await
            .unwrap();
        assert!(!c.merged);
        assert_ne!(c.id, a.id);

        let merged = kb.get_by_id(&a.id).await.unwrap();
        assert_eq!(merged.frequency, 2);
        assert_eq!(merged.sources, vec!["ticket-1", "conversation-7"]);
        assert_eq!(merged.severity, Severity::High);
        assert_eq!(merged.keywords, vec!["latency", "login", "performance"]);
        assert_eq!(merged.title, "Login is slow");

        let prov = kb.provenance(&a.id).await.unwrap();
        assert_eq!(prov.len(), 2);
        assert!(!prov[0].merged);
        assert!(prov[1].merged);
        assert_eq!(prov[1].title, "Signing in takes forever");
    }

    #[tokio::test]
    async fn test_below_threshold_inserts_new() {
        let kb = kb();
        kb.ingest(
            &raw("A", Category::PainPoint, Severity::Low, &[], vec![1.0, 0.0]),
            "i1",
        )
        .await
        .unwrap();
        let out = kb
            .ingest(
                &raw("B", Category::PainPoint, Severity::Low, &[], at_similarity(0.5)),
                "i2",
            )
            .await
            .unwrap();
        assert!(!out.merged);
        assert_eq!(kb.get_by_id(&out.id).await.unwrap().frequency, 1);
        assert_eq!(kb.summary().await.unwrap().total_opportunities, 2);
    }

    #[tokio::test]
    async fn test_severity_is_order_independent() {
        for order in [
            [Severity::High, Severity::Low],
            [Severity::Low, Severity::High],
        ] {
            let kb = kb();
            let mut id = String::new();
            for (i, sev) in order.iter().enumerate() {
                let out = kb
                    .ingest(
                        &raw("Export", Category::PainPoint, *sev, &[], vec![0.0, 1.0]),
                        &format!("item-{}", i),
                    )
                    .await
                    .unwrap();
                id = out.id;
            }
            assert_eq!(kb.get_by_id(&id).await.unwrap().severity, Severity::High);
        }
    }

    #[tokio::test]
    async fn test_keyword_union_over_many_merges() {
        let kb = kb();
        let sets: [&[&str]; 4] = [&["a", "b"], &["B", "c"], &["c ", "d"], &["a", "e"]];
        let mut id = String::new();
        for (i, kw) in sets.iter().enumerate() {
            id = kb
                .ingest(
                    &raw("Same", Category::ImprovementOpportunity, Severity::Medium, kw, vec![1.0, 1.0]),
                    &format!("src-{}", i),
                )
                .await
                .unwrap()
                .id;
        }
        let opp = kb.get_by_id(&id).await.unwrap();
        assert_eq!(opp.keywords, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(opp.frequency, 4);
        assert!(opp.is_consistent());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let kb = kb();
        assert!(matches!(
            kb.get_by_id("missing").await,
            Err(KbError::NotFound(_))
        ));
        assert!(matches!(
            kb.provenance("missing").await,
            Err(KbError::NotFound(_))
        ));
        assert!(matches!(
            kb.set_status("missing", Status::Solved).await,
            Err(KbError::NotFound(_))
        ));
        assert!(matches!(
            kb.set_comments("missing", "x").await,
            Err(KbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_input_leaves_store_unchanged() {
        let kb = kb();
        let empty = raw("Empty", Category::PainPoint, Severity::Low, &[], vec![]);
        assert!(matches!(
            kb.ingest(&empty, "i1").await,
            Err(KbError::EmptyEmbedding)
        ));

        let nan = raw("NaN", Category::PainPoint, Severity::Low, &[], vec![f32::NAN, 1.0]);
        assert!(matches!(
            kb.ingest(&nan, "i1").await,
            Err(KbError::InvalidEmbedding(_))
        ));

        let ok = raw("Fine", Category::PainPoint, Severity::Low, &[], vec![1.0]);
        assert!(kb.ingest(&ok, "  ").await.unwrap_err().is_validation());

        assert_eq!(kb.summary().await.unwrap().total_opportunities, 0);
    }

    #[tokio::test]
    async fn test_writer_lock_timeout_is_surfaced() {
        let kb = Arc::new(kb());
        let held = kb.lock.write().await;

        let r = raw("Blocked", Category::PainPoint, Severity::Low, &[], vec![1.0]);
        let err = kb.ingest(&r, "i1").await.unwrap_err();
        assert!(matches!(err, KbError::LockTimeout(_)));

        drop(held);
        assert!(kb.ingest(&r, "i1").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_ingests_serialize() {
        let kb = Arc::new(KnowledgeBase::new(
            InMemoryStore::new(),
            DedupPolicy::default(),
            Duration::from_secs(5),
        ));

        let mut handles = Vec::new();
        for i in 0..16 {
            let kb = Arc::clone(&kb);
            handles.push(tokio::spawn(async move {
                let r = raw("Crash on save", Category::PainPoint, Severity::Critical, &["crash"], vec![0.5, 0.5]);
                kb.ingest(&r, &format!("ticket-{}", i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let summary = kb.summary().await.unwrap();
        assert_eq!(summary.total_opportunities, 1);
        assert_eq!(summary.total_occurrences, 16);
    }

    #[tokio::test]
    async fn test_triage_updates_keep_last_seen() {
        let kb = kb();
        let out = kb
            .ingest(
                &raw("Dark mode", Category::FeatureRequest, Severity::Low, &[], vec![1.0]),
                "s1",
            )
            .await
            .unwrap();
        let before = kb.get_by_id(&out.id).await.unwrap();

        assert_eq!(
            kb.set_status_str(&out.id, "in_progress").await.unwrap(),
            Status::InProgress
        );
        kb.set_comments(&out.id, "planned for Q3").await.unwrap();
        assert!(matches!(
            kb.set_status_str(&out.id, "pending").await,
            Err(KbError::InvalidStatus(_))
        ));

        let after = kb.get_by_id(&out.id).await.unwrap();
        assert_eq!(after.status, Status::InProgress);
        assert_eq!(after.comments, "planned for Q3");
        assert_eq!(after.last_seen, before.last_seen);
    }

    #[tokio::test]
    async fn test_record_settings_round_trip() {
        let kb = KnowledgeBase::new(
            InMemoryStore::new(),
            DedupPolicy::new(0.85).unwrap(),
            Duration::from_secs(1),
        );
        assert!(kb.settings().await.unwrap().is_none());
        let saved = kb.record_settings(3, "disabled").await.unwrap();
        assert_eq!(saved.metric, "cosine");
        assert_eq!(saved.similarity_threshold, 0.85);
        assert_eq!(kb.settings().await.unwrap(), Some(saved));
    }

    /// Delegates reads to an in-memory store but refuses every write.
    struct ReadOnlyStore(InMemoryStore);

    #[async_trait]
    impl Store for ReadOnlyStore {
        async fn resolve_in_category(
            &self,
            _: Category,
            _: &ResolveFn<'_>,
        ) -> anyhow::Result<Resolution> {
            Err(anyhow!("disk full"))
        }
        async fn get_opportunity(&self, id: &str) -> anyhow::Result<Option<Opportunity>> {
            self.0.get_opportunity(id).await
        }
        async fn list_by_category(&self, c: Category) -> anyhow::Result<Vec<Opportunity>> {
            self.0.list_by_category(c).await
        }
        async fn list_opportunities(
            &self,
            f: &OpportunityFilter,
        ) -> anyhow::Result<Vec<Opportunity>> {
            self.0.list_opportunities(f).await
        }
        async fn provenance(&self, id: &str) -> anyhow::Result<Vec<ProvenanceRecord>> {
            self.0.provenance(id).await
        }
        async fn has_content_hash(&self, h: &str) -> anyhow::Result<bool> {
            self.0.has_content_hash(h).await
        }
        async fn update_status(&self, _: &str, _: Status) -> anyhow::Result<bool> {
            Err(anyhow!("disk full"))
        }
        async fn update_comments(&self, _: &str, _: &str) -> anyhow::Result<bool> {
            Err(anyhow!("disk full"))
        }
        async fn load_settings(&self) -> anyhow::Result<Option<KbSettings>> {
            self.0.load_settings().await
        }
        async fn save_settings(&self, _: &KbSettings) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported() {
        let kb = KnowledgeBase::new(
            ReadOnlyStore(InMemoryStore::new()),
            DedupPolicy::default(),
            Duration::from_secs(1),
        );
        let r = raw("Anything", Category::PainPoint, Severity::Low, &[], vec![1.0]);
        let err = kb.ingest(&r, "i1").await.unwrap_err();
        assert!(matches!(err, KbError::Persistence(_)));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(kb.summary().await.unwrap().total_opportunities, 0);

        // lock was released on the error path
        assert!(matches!(
            kb.ingest(&r, "i1").await,
            Err(KbError::Persistence(_))
        ));
    }

    #[test]
    fn test_store_errors_keep_their_kind() {
        let busy = store_error(KbError::LockTimeout(Duration::from_millis(50)).into());
        assert!(matches!(busy, KbError::LockTimeout(_)));

        let invalid = store_error(KbError::EmptyEmbedding.into());
        assert!(invalid.is_validation());

        let io = store_error(anyhow!("disk full"));
        assert!(matches!(io, KbError::Persistence(_)));
    }
}
