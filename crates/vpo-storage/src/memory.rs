//! In-process backends. They apply the same validation as the Postgres store
//! and back the orchestrator, maintenance and web tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use vpo_core::scoring::offer_total;
use vpo_core::{AssessmentAttributes, ContentMap, InspectionEntry, InspectionStatus};

use crate::entries::{
    external_id_of, AssessmentStore, EntryContext, EntryStore, EntryValidator, InspectionQueue,
    StoreError,
};
use crate::watermark::WatermarkStore;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<Uuid, InspectionEntry>,
    by_external_id: HashMap<String, Uuid>,
    assessments: HashMap<Uuid, (AssessmentAttributes, f64)>,
    create_attempts: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    validator: EntryValidator,
    state: Mutex<MemoryState>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(validator: EntryValidator) -> Self {
        Self {
            validator,
            state: Mutex::default(),
        }
    }

    /// Seed an entry directly, bypassing validation.
    pub async fn insert_entry(&self, entry: InspectionEntry) {
        let mut state = self.state.lock().await;
        state.by_external_id.insert(entry.external_id.clone(), entry.id);
        state.entries.insert(entry.id, entry);
    }

    pub async fn entries(&self) -> Vec<InspectionEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    pub async fn entry(&self, entry_id: Uuid) -> Option<InspectionEntry> {
        self.state.lock().await.entries.get(&entry_id).cloned()
    }

    pub async fn entry_by_external_id(&self, external_id: &str) -> Option<InspectionEntry> {
        let state = self.state.lock().await;
        state
            .by_external_id
            .get(external_id)
            .and_then(|id| state.entries.get(id))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `create_entry` calls, including rejected ones.
    pub async fn create_attempts(&self) -> usize {
        self.state.lock().await.create_attempts
    }

    pub async fn offer_total(&self, entry_id: Uuid) -> Option<f64> {
        self.state
            .lock()
            .await
            .assessments
            .get(&entry_id)
            .map(|(_, total)| *total)
    }
}

fn content_text(content: &ContentMap, key: &str) -> Option<String> {
    content
        .get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .by_external_id
            .contains_key(external_id))
    }

    async fn resolve_context(
        &self,
        owner_handle: &str,
        entry_type: &str,
    ) -> Result<EntryContext, StoreError> {
        if owner_handle.trim().is_empty() || entry_type.trim().is_empty() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "owner handle and entry type must be configured"
            )));
        }
        Ok(EntryContext {
            owner_id: format!("user:{owner_handle}"),
            entry_type: entry_type.to_string(),
        })
    }

    async fn create_entry(
        &self,
        ctx: &EntryContext,
        content: &ContentMap,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        state.create_attempts += 1;

        let errors = self.validator.validate(content);
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }
        let external_id = external_id_of(content)
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("content has no external id")))?;
        if state.by_external_id.contains_key(&external_id) {
            return Err(StoreError::DuplicateExternalId(external_id));
        }

        let now = Utc::now();
        let entry = InspectionEntry {
            id: Uuid::new_v4(),
            external_id: external_id.clone(),
            status: InspectionStatus::Unassigned,
            owner_id: ctx.owner_id.clone(),
            inspector_email: content_text(content, "inspectorEmail"),
            sales_consultant_email: content_text(content, "salesConsultantEmail"),
            content: content.clone(),
            created_at: now,
            updated_at: now,
        };
        let id = entry.id;
        state.by_external_id.insert(external_id, id);
        state.entries.insert(id, entry);
        Ok(id)
    }
}

#[async_trait]
impl AssessmentStore for InMemoryEntryStore {
    async fn load_assessment(&self, entry_id: Uuid) -> anyhow::Result<Option<AssessmentAttributes>> {
        Ok(self
            .state
            .lock()
            .await
            .assessments
            .get(&entry_id)
            .map(|(attrs, _)| attrs.clone()))
    }

    async fn save_assessment(
        &self,
        entry_id: Uuid,
        attrs: &AssessmentAttributes,
        offer_total: f64,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .assessments
            .insert(entry_id, (attrs.clone(), offer_total));
        Ok(())
    }

    async fn apply_review(
        &self,
        entry_id: Uuid,
        review_price: f64,
        review_valuation: f64,
    ) -> anyhow::Result<Option<f64>> {
        let mut state = self.state.lock().await;
        let Some((attrs, total)) = state.assessments.get_mut(&entry_id) else {
            return Ok(None);
        };
        attrs.review_price = Some(review_price);
        attrs.review_valuation = Some(review_valuation);
        *total = offer_total(attrs);
        Ok(Some(*total))
    }
}

#[async_trait]
impl InspectionQueue for InMemoryEntryStore {
    async fn stale_entries(
        &self,
        status: InspectionStatus,
        updated_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<InspectionEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.status == status && e.updated_at <= updated_before)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        entry_id: Uuid,
        to: InspectionStatus,
        clear_inspector: bool,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(&entry_id)
            .ok_or_else(|| anyhow::anyhow!("inspection entry {entry_id} not found"))?;
        entry.status = to;
        if clear_inspector {
            entry.inspector_email = None;
        }
        entry.updated_at = at;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    value: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            value: Mutex::new(Some(at)),
        }
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(*self.value.lock().await)
    }

    async fn store(&self, synced_until: DateTime<Utc>) -> anyhow::Result<()> {
        let mut value = self.value.lock().await;
        if value.map_or(true, |current| synced_until > current) {
            *value = Some(synced_until);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn content(external_id: &str) -> ContentMap {
        [
            ("externalId", json!(external_id)),
            ("make", json!("Mazda")),
            ("model", json!("3")),
            ("buildDate", json!("2012-01-01")),
            ("customerName", json!("Sam")),
            ("inspectionDate", json!("1900-01-01")),
            ("inspectorEmail", json!("drivein@inspect.example")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[tokio::test]
    async fn create_then_exists_and_duplicate_is_refused() {
        let store = InMemoryEntryStore::new();
        let ctx = store.resolve_context("sync-bot", "inspection").await.unwrap();
        let id = store.create_entry(&ctx, &content("L-1")).await.unwrap();

        assert!(store.exists_by_external_id("L-1").await.unwrap());
        let entry = store.entry(id).await.unwrap();
        assert_eq!(entry.status, InspectionStatus::Unassigned);
        assert_eq!(entry.owner_id, "user:sync-bot");
        assert_eq!(entry.inspector_email.as_deref(), Some("drivein@inspect.example"));

        let err = store.create_entry(&ctx, &content("L-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId(id) if id == "L-1"));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.create_attempts().await, 2);
    }

    #[tokio::test]
    async fn invalid_content_is_not_written() {
        let store = InMemoryEntryStore::new();
        let ctx = store.resolve_context("sync-bot", "inspection").await.unwrap();
        let mut bad = content("L-2");
        bad.insert("year".into(), json!("MY15"));
        let err = store.create_entry(&ctx, &bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref fields) if fields.contains_key("year")));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn review_keeps_earlier_attribute_edits_and_recomputes_total() {
        let store = InMemoryEntryStore::new();
        let id = Uuid::new_v4();
        let mut attrs = AssessmentAttributes {
            onsite_physical_valuation: Some(6000.0),
            approximate_expenditure: Some(800.0),
            ..Default::default()
        };
        store.save_assessment(id, &attrs, offer_total(&attrs)).await.unwrap();
        attrs.approximate_expenditure = Some(1000.0);
        store.save_assessment(id, &attrs, offer_total(&attrs)).await.unwrap();

        let total = store.apply_review(id, 4900.0, 5200.0).await.unwrap();
        assert_eq!(total, Some(4200.0));
        let saved = store.load_assessment(id).await.unwrap().unwrap();
        assert_eq!(saved.approximate_expenditure, Some(1000.0));
        assert_eq!(saved.review_valuation, Some(5200.0));
        assert_eq!(store.offer_total(id).await, Some(offer_total(&saved)));

        assert_eq!(store.apply_review(Uuid::new_v4(), 1.0, 1.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let store = InMemoryWatermarkStore::new();
        assert_eq!(store.load().await.unwrap(), None);
        store.store(later).await.unwrap();
        store.store(earlier).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(later));
    }
}
