use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use vpo_adapters::{FixtureLeadSource, LeadRecord, LeadSource, SourceError};
use vpo_core::{ContentMap, FixedClock};
use vpo_storage::{
    EntryContext, EntryStore, FetchError, InMemoryEntryStore, InMemoryWatermarkStore,
    StoreError, WatermarkStore,
};
use vpo_sync::{
    EntryWriter, FallbackTable, LocalRunLock, RunLock, SyncError, SyncOrchestrator,
    DEFAULT_PAGE_SIZE,
};

const PAGE_SIZE: u32 = 2;

/// Serves fixed pages and records every `(since, page)` request. Pages listed
/// in `failing_pages` fail with a transport error until `heal` is called.
#[derive(Default)]
struct ScriptedSource {
    pages: Vec<Vec<LeadRecord>>,
    failing_pages: HashSet<u32>,
    healed: AtomicBool,
    hang_once: AtomicBool,
    calls: Mutex<Vec<(DateTime<Utc>, u32)>>,
}

impl ScriptedSource {
    fn new(pages: Vec<Vec<LeadRecord>>) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }

    fn failing_on(mut self, page: u32) -> Self {
        self.failing_pages.insert(page);
        self
    }

    /// The first fetch never completes.
    fn hanging_once(self) -> Self {
        self.hang_once.store(true, Ordering::SeqCst);
        self
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    async fn calls(&self) -> Vec<(DateTime<Utc>, u32)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LeadSource for ScriptedSource {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, since: DateTime<Utc>, page: u32) -> Result<Vec<LeadRecord>, SourceError> {
        self.calls.lock().await.push((since, page));
        if self.hang_once.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing_pages.contains(&page) && !self.healed.load(Ordering::SeqCst) {
            return Err(SourceError::Transport {
                page,
                source: FetchError::HttpStatus {
                    status: 502,
                    endpoint: "https://partner.example/api/leads".into(),
                },
            });
        }
        Ok(self
            .pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }
}

fn lead(id: &str) -> LeadRecord {
    LeadRecord {
        id: Some(id.into()),
        name: Some("Jo Citizen".into()),
        make: Some("Toyota".into()),
        model: Some("Corolla".into()),
        build_year: Some("2015".into()),
        year: Some("2015".into()),
        ..Default::default()
    }
}

fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap()
}

struct Harness {
    source: Arc<ScriptedSource>,
    store: Arc<InMemoryEntryStore>,
    watermarks: Arc<InMemoryWatermarkStore>,
    lock: Arc<LocalRunLock>,
    orchestrator: SyncOrchestrator,
}

fn harness(source: ScriptedSource, watermarks: InMemoryWatermarkStore) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(InMemoryEntryStore::new());
    let watermarks = Arc::new(watermarks);
    let lock = Arc::new(LocalRunLock::new());
    let writer = EntryWriter::new(store.clone(), FallbackTable::default(), "sync-bot", "inspection");
    let orchestrator = SyncOrchestrator::new(
        source.clone(),
        writer,
        watermarks.clone(),
        lock.clone(),
        Arc::new(FixedClock(run_start())),
    )
    .with_page_size(PAGE_SIZE);
    Harness {
        source,
        store,
        watermarks,
        lock,
        orchestrator,
    }
}

#[tokio::test]
async fn pagination_stops_on_short_page_and_advances_watermark() {
    let h = harness(
        ScriptedSource::new(vec![
            vec![lead("L-1"), lead("L-2")],
            vec![lead("L-3"), lead("L-4")],
            vec![lead("L-5")],
        ]),
        InMemoryWatermarkStore::new(),
    );

    let summary = h.orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(summary.pages_fetched, 3);
    assert_eq!(summary.counts.success, 5);
    assert_eq!(summary.since, DateTime::<Utc>::UNIX_EPOCH);
    assert_eq!(h.store.len().await, 5);
    assert_eq!(h.watermarks.load().await.unwrap(), Some(run_start()));

    let pages: Vec<u32> = h.source.calls().await.iter().map(|(_, p)| *p).collect();
    assert_eq!(pages, vec![1, 2, 3]);
    assert!(!h.lock.is_held());
}

#[tokio::test]
async fn full_last_page_is_followed_by_an_empty_fetch() {
    let h = harness(
        ScriptedSource::new(vec![vec![lead("L-1"), lead("L-2")]]),
        InMemoryWatermarkStore::new(),
    );
    let summary = h.orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.counts.success, 2);
}

#[tokio::test]
async fn replaying_an_unchanged_window_only_finds_duplicates() {
    let pages = vec![vec![lead("L-1"), lead("L-2")], vec![lead("L-3")]];
    let previous = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let h = harness(
        ScriptedSource::new(pages.clone()),
        InMemoryWatermarkStore::starting_at(previous),
    );

    let first = h.orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(first.counts.success, 3);

    // Same lead set, same starting watermark, same entry store.
    let replay = SyncOrchestrator::new(
        Arc::new(ScriptedSource::new(pages)),
        EntryWriter::new(h.store.clone(), FallbackTable::default(), "sync-bot", "inspection"),
        Arc::new(InMemoryWatermarkStore::starting_at(previous)),
        Arc::new(LocalRunLock::new()),
        Arc::new(FixedClock(run_start())),
    )
    .with_page_size(PAGE_SIZE);
    let second = replay.sync_all_sources().await.unwrap();
    assert_eq!(second.since, previous);
    assert_eq!(second.counts.success, 0);
    assert_eq!(second.counts.duplicate, 3);
    assert_eq!(h.store.len().await, 3);
    assert_eq!(h.store.create_attempts().await, 3);
}

#[tokio::test]
async fn transport_failure_mid_run_keeps_watermark_and_next_run_refetches_window() {
    let previous = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let h = harness(
        ScriptedSource::new(vec![
            vec![lead("L-1"), lead("L-2")],
            vec![lead("L-3"), lead("L-4")],
            vec![],
        ])
        .failing_on(2),
        InMemoryWatermarkStore::starting_at(previous),
    );

    let err = h.orchestrator.sync_all_sources().await.unwrap_err();
    assert!(matches!(err, SyncError::Source(SourceError::Transport { page: 2, .. })));
    assert_eq!(h.watermarks.load().await.unwrap(), Some(previous));
    assert_eq!(h.store.len().await, 2);
    assert!(!h.lock.is_held());

    h.source.heal();
    let summary = h.orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(summary.since, previous);
    assert_eq!(summary.counts.duplicate, 2);
    assert_eq!(summary.counts.success, 2);
    assert_eq!(h.store.len().await, 4);
    assert_eq!(h.watermarks.load().await.unwrap(), Some(run_start()));

    let calls = h.source.calls().await;
    assert!(calls.iter().all(|(since, _)| *since == previous));
    let pages: Vec<u32> = calls.iter().map(|(_, p)| *p).collect();
    assert_eq!(pages, vec![1, 2, 1, 2, 3]);
}

#[tokio::test]
async fn bad_records_degrade_or_fail_without_blocking_siblings() {
    let mut bad_year = lead("L-2");
    bad_year.year = Some("MY15".into());
    let mut no_id = lead("ignored");
    no_id.id = None;

    let h = harness(
        ScriptedSource::new(vec![vec![lead("L-1"), bad_year, no_id]]),
        InMemoryWatermarkStore::new(),
    );
    let summary = h.orchestrator.sync_all_sources().await.unwrap();

    assert_eq!(summary.counts.success, 1);
    assert_eq!(summary.counts.warning, 1);
    assert_eq!(summary.counts.error, 1);
    let degraded = h.store.entry_by_external_id("L-2").await.unwrap();
    assert_eq!(degraded.content["year"], serde_json::json!(1900));
    assert_eq!(h.watermarks.load().await.unwrap(), Some(run_start()));
}

#[tokio::test]
async fn overlapping_run_is_refused_without_touching_the_watermark() {
    let h = harness(
        ScriptedSource::new(vec![vec![lead("L-1")]]),
        InMemoryWatermarkStore::new(),
    );
    assert!(h.lock.try_acquire().await.unwrap());

    let err = h.orchestrator.sync_all_sources().await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning));
    assert!(h.source.calls().await.is_empty());
    assert_eq!(h.watermarks.load().await.unwrap(), None);
    assert!(h.lock.is_held());
}

/// Entry store whose backend is unreachable.
struct UnreachableStore;

#[async_trait]
impl EntryStore for UnreachableStore {
    async fn exists_by_external_id(&self, _external_id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
    }

    async fn resolve_context(
        &self,
        _owner_handle: &str,
        _entry_type: &str,
    ) -> Result<EntryContext, StoreError> {
        Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
    }

    async fn create_entry(
        &self,
        _ctx: &EntryContext,
        _content: &ContentMap,
    ) -> Result<Uuid, StoreError> {
        Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
    }
}

#[tokio::test]
async fn store_outage_aborts_the_run_and_keeps_the_watermark() {
    let previous = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let watermarks = Arc::new(InMemoryWatermarkStore::starting_at(previous));
    let lock = Arc::new(LocalRunLock::new());
    let orchestrator = SyncOrchestrator::new(
        Arc::new(ScriptedSource::new(vec![vec![lead("L-1")]])),
        EntryWriter::new(
            Arc::new(UnreachableStore),
            FallbackTable::default(),
            "sync-bot",
            "inspection",
        ),
        watermarks.clone(),
        lock.clone(),
        Arc::new(FixedClock(run_start())),
    )
    .with_page_size(PAGE_SIZE);

    let err = orchestrator.sync_all_sources().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Store {
            ref external_id,
            source: StoreError::Backend(_),
        } if external_id == "L-1"
    ));
    assert_eq!(watermarks.load().await.unwrap(), Some(previous));
    assert!(!lock.is_held());
}

#[tokio::test]
async fn cancelled_run_frees_the_lock_for_the_next_run() {
    let h = harness(
        ScriptedSource::new(vec![vec![lead("L-1")]]).hanging_once(),
        InMemoryWatermarkStore::new(),
    );

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), h.orchestrator.sync_all_sources()).await;
    assert!(cancelled.is_err());
    assert!(!h.lock.is_held());
    assert_eq!(h.watermarks.load().await.unwrap(), None);

    let summary = h.orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(summary.counts.success, 1);
    assert_eq!(h.watermarks.load().await.unwrap(), Some(run_start()));
}

#[tokio::test]
async fn bundled_fixture_is_ingested_completely_with_the_default_page_size() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/partner-leads/pages.json");
    let store = Arc::new(InMemoryEntryStore::new());
    let orchestrator = SyncOrchestrator::new(
        Arc::new(FixtureLeadSource::load(path).unwrap()),
        EntryWriter::new(store.clone(), FallbackTable::default(), "sync-bot", "inspection"),
        Arc::new(InMemoryWatermarkStore::new()),
        Arc::new(LocalRunLock::new()),
        Arc::new(FixedClock(run_start())),
    )
    .with_page_size(DEFAULT_PAGE_SIZE);
    assert_eq!(orchestrator.page_size(), 2);

    let summary = orchestrator.sync_all_sources().await.unwrap();
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.counts.total(), 3);
    assert_eq!(store.len().await, 3);
}
