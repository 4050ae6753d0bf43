//! Entry store contracts and the field validation every backend applies
//! before an inspection entry is written.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use vpo_core::{AssessmentAttributes, ContentMap, InspectionEntry, InspectionStatus};

pub const EXTERNAL_ID_KEY: &str = "externalId";

const REQUIRED_KEYS: [&str; 6] = [
    EXTERNAL_ID_KEY,
    "make",
    "model",
    "buildDate",
    "customerName",
    "inspectionDate",
];
const DATE_KEYS: [&str; 3] = ["buildDate", "inspectionDate", "regoExpiry"];
const NON_NEGATIVE_KEYS: [&str; 3] = ["averageTotalForCarType", "maxTotalForCarType", "kms"];
const EMAIL_KEYS: [&str; 3] = ["email", "inspectorEmail", "salesConsultantEmail"];

/// Owner identity and entry type a new entry is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryContext {
    pub owner_id: String,
    pub entry_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRejection {
    pub message: String,
    pub rejected: JsonValue,
}

pub type FieldErrors = BTreeMap<String, FieldRejection>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry rejected: invalid field(s) [{}]", field_list(.0))]
    Validation(FieldErrors),
    #[error("entry with external id {0} already exists")]
    DuplicateExternalId(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

fn field_list(errors: &FieldErrors) -> String {
    errors.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn exists_by_external_id(&self, external_id: &str) -> Result<bool, StoreError>;

    async fn resolve_context(
        &self,
        owner_handle: &str,
        entry_type: &str,
    ) -> Result<EntryContext, StoreError>;

    /// Validate and insert. Field-level problems come back as
    /// [`StoreError::Validation`] and nothing is written.
    async fn create_entry(
        &self,
        ctx: &EntryContext,
        content: &ContentMap,
    ) -> Result<Uuid, StoreError>;
}

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    async fn load_assessment(&self, entry_id: Uuid) -> anyhow::Result<Option<AssessmentAttributes>>;

    async fn save_assessment(
        &self,
        entry_id: Uuid,
        attrs: &AssessmentAttributes,
        offer_total: f64,
    ) -> anyhow::Result<()>;

    /// Set the review figures on the stored assessment and persist the offer
    /// total recomputed from it, as one read-modify-write that concurrent
    /// edits cannot interleave with. `Ok(None)` when no assessment exists.
    async fn apply_review(
        &self,
        entry_id: Uuid,
        review_price: f64,
        review_valuation: f64,
    ) -> anyhow::Result<Option<f64>>;
}

#[async_trait]
pub trait InspectionQueue: Send + Sync {
    async fn stale_entries(
        &self,
        status: InspectionStatus,
        updated_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<InspectionEntry>>;

    async fn transition(
        &self,
        entry_id: Uuid,
        to: InspectionStatus,
        clear_inspector: bool,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct EntryValidator {
    pub min_year: i64,
    pub max_year: i64,
}

impl Default for EntryValidator {
    fn default() -> Self {
        Self {
            min_year: 1900,
            max_year: 2100,
        }
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email regex"))
}

fn reject(errors: &mut FieldErrors, key: &str, message: impl Into<String>, rejected: &JsonValue) {
    errors.insert(
        key.to_string(),
        FieldRejection {
            message: message.into(),
            rejected: rejected.clone(),
        },
    );
}

impl EntryValidator {
    pub fn validate(&self, content: &ContentMap) -> FieldErrors {
        let mut errors = FieldErrors::new();

        for key in REQUIRED_KEYS {
            let present = match content.get(key) {
                Some(JsonValue::String(s)) => !s.trim().is_empty(),
                Some(JsonValue::Null) | None => false,
                Some(_) => true,
            };
            if !present {
                reject(&mut errors, key, "is required", &JsonValue::Null);
            }
        }

        if let Some(value) = content.get("year") {
            let in_range = value
                .as_i64()
                .is_some_and(|year| (self.min_year..=self.max_year).contains(&year));
            if !in_range {
                reject(
                    &mut errors,
                    "year",
                    format!("must be a year between {} and {}", self.min_year, self.max_year),
                    value,
                );
            }
        }

        for key in DATE_KEYS {
            if let Some(value) = content.get(key) {
                let valid = value
                    .as_str()
                    .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok());
                if !valid {
                    reject(&mut errors, key, "must be an ISO date (YYYY-MM-DD)", value);
                }
            }
        }

        for key in NON_NEGATIVE_KEYS {
            if let Some(value) = content.get(key) {
                if !value.as_f64().is_some_and(|n| n.is_finite() && n >= 0.0) {
                    reject(&mut errors, key, "must be a non-negative number", value);
                }
            }
        }

        for key in EMAIL_KEYS {
            if let Some(value) = content.get(key) {
                if !value.as_str().is_some_and(|s| email_pattern().is_match(s)) {
                    reject(&mut errors, key, "must be an email address", value);
                }
            }
        }

        if let Some(value) = content.get("doors") {
            if !value.as_u64().is_some_and(|doors| (1..=9).contains(&doors)) {
                reject(&mut errors, "doors", "must be between 1 and 9", value);
            }
        }

        errors
    }
}

pub fn external_id_of(content: &ContentMap) -> Option<&str> {
    content
        .get(EXTERNAL_ID_KEY)
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
}
