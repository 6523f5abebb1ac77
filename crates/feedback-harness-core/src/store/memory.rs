//! In-memory [`Store`] implementation for testing and embedding in other
//! processes.
//!
//! All state lives behind one `std::sync::RwLock`. A
//! [`resolve_in_category`](Store::resolve_in_category) reads its candidates,
//! swaps the opportunity and appends provenance under a single write guard,
//! so readers never see half of it and concurrent writers never decide on a
//! stale snapshot.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::dedup::Resolution;
use crate::models::{Category, KbSettings, Opportunity, ProvenanceRecord, Status};

use super::{OpportunityFilter, ResolveFn, Store};

#[derive(Default)]
struct Inner {
    opportunities: HashMap<String, Opportunity>,
    provenance: Vec<ProvenanceRecord>,
    settings: Option<KbSettings>,
}

/// In-memory store for tests and ephemeral knowledge bases.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Inner {
    fn apply(&mut self, opportunity: &Opportunity, provenance: &ProvenanceRecord) {
        match self.opportunities.get_mut(&opportunity.id) {
            Some(existing) => {
                let (status, comments) = (existing.status, std::mem::take(&mut existing.comments));
                *existing = opportunity.clone();
                existing.status = status;
                existing.comments = comments;
            }
            None => {
                self.opportunities
                    .insert(opportunity.id.clone(), opportunity.clone());
            }
        }
        self.provenance.push(provenance.clone());
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn resolve_in_category(
        &self,
        category: Category,
        decide: &ResolveFn<'_>,
    ) -> Result<Resolution> {
        let mut inner = self.write()?;
        let candidates: Vec<Opportunity> = inner
            .opportunities
            .values()
            .filter(|o| o.category == category)
            .cloned()
            .collect();
        let resolution = decide(&candidates)?;
        inner.apply(&resolution.opportunity, &resolution.provenance);
        Ok(resolution)
    }

    async fn get_opportunity(&self, id: &str) -> Result<Option<Opportunity>> {
        Ok(self.read()?.opportunities.get(id).cloned())
    }

    async fn list_by_category(&self, category: Category) -> Result<Vec<Opportunity>> {
        Ok(self
            .read()?
            .opportunities
            .values()
            .filter(|o| o.category == category)
            .cloned()
            .collect())
    }

    async fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        Ok(self
            .read()?
            .opportunities
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect())
    }

    async fn provenance(&self, opportunity_id: &str) -> Result<Vec<ProvenanceRecord>> {
        Ok(self
            .read()?
            .provenance
            .iter()
            .filter(|p| p.opportunity_id == opportunity_id)
            .cloned()
            .collect())
    }

    async fn has_content_hash(&self, content_hash: &str) -> Result<bool> {
        Ok(self
            .read()?
            .provenance
            .iter()
            .any(|p| p.content_hash == content_hash))
    }

    async fn update_status(&self, id: &str, status: Status) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(match inner.opportunities.get_mut(id) {
            Some(opp) => {
                opp.status = status;
                true
            }
            None => false,
        })
    }

    async fn update_comments(&self, id: &str, comments: &str) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(match inner.opportunities.get_mut(id) {
            Some(opp) => {
                opp.comments = comments.to_string();
                true
            }
            None => false,
        })
    }

    async fn load_settings(&self) -> Result<Option<KbSettings>> {
        Ok(self.read()?.settings.clone())
    }

    async fn save_settings(&self, settings: &KbSettings) -> Result<()> {
        self.write()?.settings = Some(settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::new_opportunity;
    use crate::models::{RawOpportunity, Severity};
    use chrono::Utc;

    fn sample(id: &str, category: Category, severity: Severity) -> (Opportunity, ProvenanceRecord) {
        let raw = RawOpportunity {
            title: format!("title {}", id),
            description: String::new(),
            category,
            severity,
            keywords: vec![],
            embedding: vec![1.0],
        };
        let now = Utc::now();
        let opp = new_opportunity(id.to_string(), &raw, "item", now);
        let prov = ProvenanceRecord {
            opportunity_id: id.to_string(),
            content_item_id: "item".into(),
            title: raw.title.clone(),
            description: String::new(),
            similarity: None,
            merged: false,
            content_hash: raw.content_hash("item"),
            recorded_at: now,
        };
        (opp, prov)
    }

    /// Persist a fixed resolution, ignoring the candidates.
    async fn seed(store: &InMemoryStore, opp: &Opportunity, prov: &ProvenanceRecord) {
        let decide = |_: &[Opportunity]| -> Result<Resolution, crate::KbError> {
            Ok(Resolution {
                opportunity: opp.clone(),
                provenance: prov.clone(),
                merged: false,
                similarity: None,
            })
        };
        store
            .resolve_in_category(opp.category, &decide)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = InMemoryStore::new();
        let (opp, prov) = sample("a", Category::PainPoint, Severity::Low);
        seed(&store, &opp, &prov).await;

        assert_eq!(store.get_opportunity("a").await.unwrap(), Some(opp));
        assert!(store.get_opportunity("missing").await.unwrap().is_none());
        assert_eq!(store.provenance("a").await.unwrap(), vec![prov.clone()]);
        assert!(store.has_content_hash(&prov.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_filters() {
        let store = InMemoryStore::new();
        for (id, cat, sev) in [
            ("a", Category::PainPoint, Severity::Low),
            ("b", Category::PainPoint, Severity::Critical),
            ("c", Category::FeatureRequest, Severity::High),
        ] {
            let (opp, prov) = sample(id, cat, sev);
            seed(&store, &opp, &prov).await;
        }

        assert_eq!(store.list_by_category(Category::PainPoint).await.unwrap().len(), 2);

        let filter = OpportunityFilter {
            min_severity: Some(Severity::High),
            ..Default::default()
        };
        let mut ids: Vec<String> = store
            .list_opportunities(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_resolution_keeps_triage_fields() {
        let store = InMemoryStore::new();
        let (opp, prov) = sample("a", Category::PainPoint, Severity::Low);
        seed(&store, &opp, &prov).await;
        store.update_status("a", Status::Solved).await.unwrap();
        store.update_comments("a", "shipped in 2.4").await.unwrap();

        // a merge computed from a snapshot taken before the triage edit
        let mut merged = opp.clone();
        merged.frequency = 2;
        merged.sources.push("item-2".into());
        seed(&store, &merged, &prov).await;

        let got = store.get_opportunity("a").await.unwrap().unwrap();
        assert_eq!(got.frequency, 2);
        assert_eq!(got.status, Status::Solved);
        assert_eq!(got.comments, "shipped in 2.4");
    }

    #[tokio::test]
    async fn test_resolve_in_category_sees_only_that_category() {
        let store = InMemoryStore::new();
        for (id, cat) in [("a", Category::PainPoint), ("b", Category::FeatureRequest)] {
            let (opp, prov) = sample(id, cat, Severity::Low);
            seed(&store, &opp, &prov).await;
        }

        let seen = std::sync::Mutex::new(Vec::new());
        let (opp, prov) = sample("c", Category::PainPoint, Severity::High);
        let decide = |candidates: &[Opportunity]| -> Result<Resolution, crate::KbError> {
            seen.lock()
                .unwrap()
                .extend(candidates.iter().map(|c| c.id.clone()));
            Ok(Resolution {
                opportunity: opp.clone(),
                provenance: prov.clone(),
                merged: false,
                similarity: None,
            })
        };
        store
            .resolve_in_category(Category::PainPoint, &decide)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        assert!(store.get_opportunity("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_error_writes_nothing() {
        let store = InMemoryStore::new();
        let decide =
            |_: &[Opportunity]| -> Result<Resolution, crate::KbError> { Err(crate::KbError::EmptyEmbedding) };
        let err = store
            .resolve_in_category(Category::PainPoint, &decide)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<crate::KbError>(),
            Some(crate::KbError::EmptyEmbedding)
        ));
        assert!(store
            .list_opportunities(&OpportunityFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_seen_window_filter() {
        use chrono::TimeZone;

        let store = InMemoryStore::new();
        let (mut opp, prov) = sample("a", Category::PainPoint, Severity::Low);
        opp.first_seen = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        opp.last_seen = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
        seed(&store, &opp, &prov).await;

        let count = |since: Option<&str>, until: Option<&str>| {
            let filter = OpportunityFilter {
                since: since.map(|s| crate::store::parse_time_bound(s, false).unwrap()),
                until: until.map(|s| crate::store::parse_time_bound(s, true).unwrap()),
                ..Default::default()
            };
            store
                .read()
                .unwrap()
                .opportunities
                .values()
                .filter(|o| filter.matches(o))
                .count()
        };

        assert_eq!(count(Some("2024-04-01"), None), 1);
        assert_eq!(count(Some("2024-04-16"), None), 0);
        assert_eq!(count(None, Some("2024-03-01")), 1);
        assert_eq!(count(None, Some("2024-02-29")), 0);
        assert_eq!(count(Some("2024-01-01"), Some("2024-12-31")), 1);
    }

    #[tokio::test]
    async fn test_triage_updates() {
        let store = InMemoryStore::new();
        let (opp, prov) = sample("a", Category::PainPoint, Severity::Low);
        seed(&store, &opp, &prov).await;

        assert!(store.update_status("a", Status::Blocked).await.unwrap());
        assert!(store.update_comments("a", "waiting on vendor").await.unwrap());
        assert!(!store.update_status("nope", Status::Solved).await.unwrap());

        let got = store.get_opportunity("a").await.unwrap().unwrap();
        assert_eq!(got.status, Status::Blocked);
        assert_eq!(got.comments, "waiting on vendor");
    }
}
