//! Dedup-then-degrade persistence of normalized leads.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, warn};
use uuid::Uuid;
use vpo_adapters::NormalizedLead;
use vpo_core::{Categorical, ContentMap};
use vpo_storage::entries::EXTERNAL_ID_KEY;
use vpo_storage::{EntryStore, FieldErrors, StoreError};

pub const UNKNOWN: &str = "UNKNOWN";
/// Inspection date placeholder meaning "not yet scheduled".
pub const UNSCHEDULED_DATE: &str = "1900-01-01";
pub const FALLBACK_BUILD_DATE: &str = "1900-01-01";

/// Field name to safe substitute used by the degraded retry. Failing fields
/// without an entry are dropped from the content map.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackTable {
    values: BTreeMap<String, JsonValue>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::from_pairs([
            ("year", json!(1900)),
            ("averageTotalForCarType", json!(0)),
            ("maxTotalForCarType", json!(0)),
            ("buildDate", json!(FALLBACK_BUILD_DATE)),
        ])
    }
}

impl FallbackTable {
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, JsonValue)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn fallback_for(&self, field: &str) -> Option<&JsonValue> {
        self.values.get(field)
    }

    /// Copy of `content` with every rejected field substituted or dropped.
    pub fn degrade(&self, content: &ContentMap, errors: &FieldErrors) -> ContentMap {
        let mut degraded = content.clone();
        for field in errors.keys() {
            match self.fallback_for(field) {
                Some(value) => {
                    degraded.insert(field.clone(), value.clone());
                }
                None => {
                    degraded.remove(field);
                }
            }
        }
        degraded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Success,
    Duplicate,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Success { entry_id: Uuid },
    Duplicate,
    /// Written after substituting the rejected fields; `degraded` keeps the
    /// original rejected values.
    Warning { entry_id: Uuid, degraded: FieldErrors },
    Error { reason: String },
}

impl SaveOutcome {
    pub fn status(&self) -> SaveStatus {
        match self {
            Self::Success { .. } => SaveStatus::Success,
            Self::Duplicate => SaveStatus::Duplicate,
            Self::Warning { .. } => SaveStatus::Warning,
            Self::Error { .. } => SaveStatus::Error,
        }
    }
}

fn insert_text(content: &mut ContentMap, key: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
        content.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

/// Numeric when the text parses as an amount, else the raw text so the store
/// can reject it and the fallback table takes over.
fn amount_or_raw(raw: &str) -> JsonValue {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ',' | '$')).collect();
    match cleaned.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => json!(n),
        _ => JsonValue::String(raw.to_string()),
    }
}

fn year_or_raw(raw: &str) -> JsonValue {
    raw.parse::<i64>()
        .map(JsonValue::from)
        .unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

pub fn build_content_map(lead: &NormalizedLead) -> ContentMap {
    let mut content = ContentMap::new();

    insert_text(&mut content, EXTERNAL_ID_KEY, lead.external_id.as_deref());
    content.insert("make".into(), json!(lead.make.as_deref().unwrap_or(UNKNOWN)));
    content.insert("model".into(), json!(lead.model.as_deref().unwrap_or(UNKNOWN)));
    content.insert(
        "buildDate".into(),
        json!(lead
            .build_year
            .as_deref()
            .map(|year| format!("{year}-01-01"))
            .unwrap_or_else(|| FALLBACK_BUILD_DATE.to_string())),
    );
    content.insert(
        "customerName".into(),
        json!(lead.customer_name.as_deref().unwrap_or(UNKNOWN)),
    );
    content.insert("inspectionDate".into(), json!(UNSCHEDULED_DATE));

    for (key, value) in [
        ("email", &lead.email),
        ("phone", &lead.phone),
        ("address", &lead.address),
        ("city", &lead.city),
        ("state", &lead.state),
        ("series", &lead.series),
        ("badge", &lead.badge),
        ("body", &lead.body),
        ("engine", &lead.engine),
        ("rego", &lead.rego),
        ("seats", &lead.seats),
        ("financeValue", &lead.finance_value),
        ("bottomPriceEstimate", &lead.bottom_price_estimate),
        ("inspectorEmail", &lead.inspector_email),
        ("salesConsultantEmail", &lead.sales_consultant_email),
    ] {
        insert_text(&mut content, key, value.as_deref());
    }

    if let Some(year) = &lead.year {
        content.insert("year".into(), year_or_raw(year));
    }
    if let Some(latest) = &lead.latest_pricing {
        content.insert("averageTotalForCarType".into(), amount_or_raw(latest));
    }
    if let Some(top) = &lead.top_price_estimate {
        content.insert("maxTotalForCarType".into(), amount_or_raw(top));
    }

    if let Some(engine_type) = lead.engine_type {
        content.insert("engineType".into(), json!(engine_type.as_str()));
    }
    if let Some(drive_train) = lead.drive_train {
        content.insert("driveTrain".into(), json!(drive_train.as_str()));
    }
    if let Some(transmission) = lead.transmission {
        content.insert("transmission".into(), json!(transmission.as_str()));
    }
    content.insert("colour".into(), json!(lead.colour.as_str()));
    if let Some(kms) = lead.kms {
        content.insert("kms".into(), json!(kms));
    }
    if let Some(doors) = lead.doors {
        content.insert("doors".into(), json!(doors));
    }
    if let Some(expiry) = lead.rego_expiry {
        content.insert("regoExpiry".into(), json!(expiry.format("%Y-%m-%d").to_string()));
    }

    content.insert("spareKey".into(), json!(lead.spare_key));
    content.insert("logBooks".into(), json!(lead.log_books));
    content.insert("sunroof".into(), json!(lead.sunroof));
    content.insert("satNav".into(), json!(lead.sat_nav));
    content.insert("leather".into(), json!(lead.leather));

    content
}

fn rejected_summary(errors: &FieldErrors) -> String {
    serde_json::to_string(errors).unwrap_or_else(|_| format!("{errors:?}"))
}

fn content_dump(content: &ContentMap) -> String {
    serde_json::to_string(content).unwrap_or_else(|_| format!("{content:?}"))
}

/// Writes normalized leads through an [`EntryStore`], applying the
/// existence check and a single degraded retry on validation failure.
///
/// Record-level problems (no external id, a degraded retry the store still
/// rejects) come back as [`SaveOutcome::Error`]. A store that cannot answer
/// at all is returned as `Err` so the caller can stop the run.
#[derive(Clone)]
pub struct EntryWriter {
    store: Arc<dyn EntryStore>,
    fallbacks: FallbackTable,
    owner_handle: String,
    entry_type: String,
}

impl EntryWriter {
    pub fn new(
        store: Arc<dyn EntryStore>,
        fallbacks: FallbackTable,
        owner_handle: impl Into<String>,
        entry_type: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fallbacks,
            owner_handle: owner_handle.into(),
            entry_type: entry_type.into(),
        }
    }

    pub async fn save_record(&self, lead: &NormalizedLead) -> Result<SaveOutcome, StoreError> {
        let Some(external_id) = lead.external_id.as_deref() else {
            error!(lead = ?lead, "lead has no external id; skipping");
            return Ok(SaveOutcome::Error {
                reason: "missing external id".into(),
            });
        };

        if self.store.exists_by_external_id(external_id).await? {
            return Ok(SaveOutcome::Duplicate);
        }
        let ctx = self
            .store
            .resolve_context(&self.owner_handle, &self.entry_type)
            .await?;

        let content = build_content_map(lead);
        let rejected = match self.store.create_entry(&ctx, &content).await {
            Ok(entry_id) => return Ok(SaveOutcome::Success { entry_id }),
            Err(StoreError::DuplicateExternalId(_)) => return Ok(SaveOutcome::Duplicate),
            Err(StoreError::Validation(errors)) => errors,
            Err(err) => return Err(err),
        };

        let degraded = self.fallbacks.degrade(&content, &rejected);
        match self.store.create_entry(&ctx, &degraded).await {
            Ok(entry_id) => {
                warn!(
                    external_id,
                    %entry_id,
                    fields = ?rejected.keys().collect::<Vec<_>>(),
                    rejected = %rejected_summary(&rejected),
                    "entry saved with fallback values; needs manual follow-up"
                );
                Ok(SaveOutcome::Warning {
                    entry_id,
                    degraded: rejected,
                })
            }
            Err(StoreError::DuplicateExternalId(_)) => Ok(SaveOutcome::Duplicate),
            Err(err @ StoreError::Validation(_)) => {
                error!(
                    external_id,
                    error = %err,
                    first_rejection = %rejected_summary(&rejected),
                    content = %content_dump(&degraded),
                    "degraded entry write failed; record skipped"
                );
                Ok(SaveOutcome::Error {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpo_adapters::{normalize, LeadRecord};
    use vpo_storage::{EntryValidator, InMemoryEntryStore};

    fn lead(f: impl FnOnce(&mut LeadRecord)) -> NormalizedLead {
        let mut record = LeadRecord {
            id: Some("PL-1".into()),
            name: Some("Jo Citizen".into()),
            make: Some("Toyota".into()),
            model: Some("Corolla".into()),
            build_year: Some("2015".into()),
            ..Default::default()
        };
        f(&mut record);
        normalize(&record).lead
    }

    fn writer(store: Arc<InMemoryEntryStore>) -> EntryWriter {
        EntryWriter::new(store, FallbackTable::default(), "sync-bot", "inspection")
    }

    #[test]
    fn content_map_fills_required_fallbacks_and_drops_empties() {
        let content = build_content_map(&lead(|r| {
            r.make = None;
            r.name = None;
            r.build_year = None;
            r.phone = None;
        }));
        assert_eq!(content["make"], json!(UNKNOWN));
        assert_eq!(content["customerName"], json!(UNKNOWN));
        assert_eq!(content["buildDate"], json!("1900-01-01"));
        assert_eq!(content["inspectionDate"], json!(UNSCHEDULED_DATE));
        assert_eq!(content["colour"], json!("other"));
        assert!(!content.contains_key("phone"));
        assert!(!content.contains_key("kms"));
    }

    #[test]
    fn content_map_maps_typed_and_pricing_fields() {
        let content = build_content_map(&lead(|r| {
            r.year = Some("2015".into());
            r.kms = Some("120,000".into());
            r.fwd_rwd = Some("4x4".into());
            r.latest_pricing = Some("$10,650".into());
            r.top_price_estimate = Some("11800".into());
            r.spare_key = Some("yes".into());
        }));
        assert_eq!(content["buildDate"], json!("2015-01-01"));
        assert_eq!(content["year"], json!(2015));
        assert_eq!(content["kms"], json!(120000.0));
        assert_eq!(content["driveTrain"], json!("4X"));
        assert_eq!(content["averageTotalForCarType"], json!(10650.0));
        assert_eq!(content["maxTotalForCarType"], json!(11800.0));
        assert_eq!(content["spareKey"], json!(true));
    }

    #[test]
    fn fallback_table_substitutes_known_and_drops_unknown_fields() {
        let mut content = ContentMap::new();
        content.insert("year".into(), json!("MY15"));
        content.insert("email".into(), json!("nope"));
        let mut errors = FieldErrors::new();
        for (field, value) in [("year", json!("MY15")), ("email", json!("nope"))] {
            errors.insert(
                field.into(),
                vpo_storage::FieldRejection {
                    message: "invalid".into(),
                    rejected: value,
                },
            );
        }
        let degraded = FallbackTable::default().degrade(&content, &errors);
        assert_eq!(degraded["year"], json!(1900));
        assert!(!degraded.contains_key("email"));
    }

    #[tokio::test]
    async fn new_lead_is_saved_then_replay_is_duplicate() {
        let store = Arc::new(InMemoryEntryStore::new());
        let writer = writer(store.clone());
        let lead = lead(|_| {});

        assert!(matches!(writer.save_record(&lead).await.unwrap(), SaveOutcome::Success { .. }));
        assert_eq!(writer.save_record(&lead).await.unwrap(), SaveOutcome::Duplicate);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.create_attempts().await, 1);
    }

    #[tokio::test]
    async fn invalid_year_degrades_to_fallback_and_keeps_original_value() {
        let store = Arc::new(InMemoryEntryStore::new());
        let outcome = writer(store.clone())
            .save_record(&lead(|r| r.year = Some("MY15".into())))
            .await
            .unwrap();

        let SaveOutcome::Warning { entry_id, degraded } = outcome else {
            panic!("expected warning, got {outcome:?}");
        };
        assert_eq!(degraded["year"].rejected, json!("MY15"));
        let entry = store.entry(entry_id).await.unwrap();
        assert_eq!(entry.content["year"], json!(1900));
    }

    #[tokio::test]
    async fn failing_degraded_retry_is_an_error_and_writes_nothing() {
        let store = Arc::new(InMemoryEntryStore::with_validator(EntryValidator {
            min_year: 2000,
            max_year: 2100,
        }));
        let outcome = writer(store.clone())
            .save_record(&lead(|r| r.year = Some("1950".into())))
            .await
            .unwrap();
        assert_eq!(outcome.status(), SaveStatus::Error);
        assert!(store.is_empty().await);
        assert_eq!(store.create_attempts().await, 2);
    }

    #[tokio::test]
    async fn lead_without_id_is_an_error() {
        let store = Arc::new(InMemoryEntryStore::new());
        let outcome = writer(store.clone())
            .save_record(&lead(|r| r.id = None))
            .await
            .unwrap();
        assert_eq!(outcome.status(), SaveStatus::Error);
        assert_eq!(store.create_attempts().await, 0);
    }

    #[tokio::test]
    async fn unresolvable_owner_is_a_store_failure_not_a_record_error() {
        let store = Arc::new(InMemoryEntryStore::new());
        let writer = EntryWriter::new(store.clone(), FallbackTable::default(), " ", "inspection");
        let err = writer.save_record(&lead(|_| {})).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.create_attempts().await, 0);
    }
}
