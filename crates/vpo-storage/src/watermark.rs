use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persisted boundary of the last fully-completed sync run.
///
/// Backends never move the stored value backwards: storing an older
/// timestamp than the current one is a no-op.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn store(&self, synced_until: DateTime<Utc>) -> anyhow::Result<()>;
}
