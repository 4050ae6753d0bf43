//! Partner lead source contracts, the token-authenticated partner API client,
//! a fixture-backed source, and the record normalizer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use vpo_storage::{redacted_endpoint, FetchError, HttpFetcher, PageArchive, PageCapture};

pub use reqwest::Url;

pub mod normalize;

pub use normalize::{normalize, NormalizationWarning, Normalized, NormalizedLead};

pub const CRATE_NAME: &str = "vpo-adapters";

/// Server-side status filter selecting leads that are ready to be ingested.
pub const DEFAULT_READY_STATUS_TAG: &str = "ready-for-sync";

/// Accept strings, numbers and booleans as text; trim, and treat empty as absent.
fn loose_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    let text = match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(if b { "yes" } else { "no" }.to_string()),
        _ => None,
    };
    Ok(text
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

macro_rules! lead_record {
    ($($field:ident),+ $(,)?) => {
        /// Raw lead as returned by the partner API. Every value is captured as
        /// trimmed text; empty values are absent.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct LeadRecord {
            $(
                #[serde(default, deserialize_with = "loose_text", skip_serializing_if = "Option::is_none")]
                pub $field: Option<String>,
            )+
        }
    };
}

lead_record!(
    id,
    name,
    email,
    phone,
    address,
    make,
    model,
    build_year,
    engine,
    kms,
    series,
    state,
    year,
    city,
    transmission,
    body,
    badge,
    car_colour,
    doors,
    fuel_type,
    fwd_rwd,
    spare_key,
    log_books,
    rego,
    rego_expiry,
    sunroof,
    sat_nav,
    leather,
    seats,
    finance_value,
    bottom_price_estimate,
    top_price_estimate,
    inspector_email,
    sales_consultant_email,
    latest_pricing,
);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport failure fetching page {page}")]
    Transport {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("page {page} is not a JSON array of lead records")]
    Decode {
        page: u32,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    pub fn page(&self) -> u32 {
        match self {
            Self::Transport { page, .. } | Self::Decode { page, .. } => *page,
        }
    }
}

/// Paginated lead feed. Pages are 1-based; a page shorter than the configured
/// page size is the last one.
#[async_trait]
pub trait LeadSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Page size the source itself pages by, overriding the configured one.
    fn page_size_hint(&self) -> Option<u32> {
        None
    }

    async fn fetch(&self, since: DateTime<Utc>, page: u32) -> Result<Vec<LeadRecord>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct PartnerConfig {
    pub endpoint: Url,
    pub token: String,
    pub status_tag: String,
}

pub fn since_param(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct PartnerApiClient {
    config: PartnerConfig,
    http: HttpFetcher,
    archive: Option<PageArchive>,
}

impl PartnerApiClient {
    pub fn new(config: PartnerConfig, http: HttpFetcher) -> Self {
        Self {
            config,
            http,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn page_url(&self, since: DateTime<Utc>, page: u32) -> Url {
        let mut url = self.config.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("since", &since_param(since))
            .append_pair("token", &self.config.token)
            .append_pair("status", &self.config.status_tag);
        url
    }
}

#[async_trait]
impl LeadSource for PartnerApiClient {
    fn source_id(&self) -> &str {
        "partner-api"
    }

    async fn fetch(&self, since: DateTime<Utc>, page: u32) -> Result<Vec<LeadRecord>, SourceError> {
        let url = self.page_url(since, page);
        let endpoint = redacted_endpoint(&url);
        let response = self
            .http
            .fetch_bytes(url)
            .await
            .map_err(|source| SourceError::Transport { page, source })?;

        if let Some(archive) = &self.archive {
            let capture = PageCapture {
                since,
                page,
                endpoint: &endpoint,
                fetched_at: Utc::now(),
                body: &response.body,
            };
            match archive.record(capture).await {
                Ok(record) => debug!(page, body = %record.body_file, repeated = record.repeated, "captured partner page"),
                Err(err) => warn!(page, error = format!("{err:#}"), "failed to capture partner page"),
            }
        }

        serde_json::from_slice(&response.body).map_err(|source| SourceError::Decode { page, source })
    }
}

/// Lead source replaying pages from a JSON fixture (an array of pages, each an
/// array of lead records). It pages by its largest fixture page, so a short
/// page still ends the run and every full page is followed.
#[derive(Debug, Clone, Default)]
pub struct FixtureLeadSource {
    pages: Vec<Vec<LeadRecord>>,
}

impl FixtureLeadSource {
    pub fn new(pages: Vec<Vec<LeadRecord>>) -> Self {
        Self { pages }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl LeadSource for FixtureLeadSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    fn page_size_hint(&self) -> Option<u32> {
        let largest = self.pages.iter().map(Vec::len).max()?;
        u32::try_from(largest).ok().filter(|size| *size > 0)
    }

    async fn fetch(&self, _since: DateTime<Utc>, page: u32) -> Result<Vec<LeadRecord>, SourceError> {
        let index = page.saturating_sub(1) as usize;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
