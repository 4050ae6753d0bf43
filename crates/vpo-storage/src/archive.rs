//! Capture log of raw partner pages.
//!
//! Each sync window (`since`) gets its own directory. Page bodies are kept
//! once per distinct content, and every fetch appends a line to
//! `captures.jsonl` so a window can be replayed or audited page by page,
//! including re-fetches after an aborted run.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const CAPTURE_LOG: &str = "captures.jsonl";
const HASH_PREFIX_LEN: usize = 12;

/// One fetched page as handed over by the partner client.
#[derive(Debug, Clone, Copy)]
pub struct PageCapture<'a> {
    pub since: DateTime<Utc>,
    pub page: u32,
    /// Endpoint with the query string removed.
    pub endpoint: &'a str,
    pub fetched_at: DateTime<Utc>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub since: DateTime<Utc>,
    pub page: u32,
    pub endpoint: String,
    pub fetched_at: DateTime<Utc>,
    pub sha256: String,
    pub byte_size: usize,
    /// Body file name relative to the window directory.
    pub body_file: String,
    /// The same page of this window was captured before with identical content.
    pub repeated: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn window_dir(&self, since: DateTime<Utc>) -> PathBuf {
        self.root.join(since.format("%Y%m%dT%H%M%SZ").to_string())
    }

    pub async fn record(&self, capture: PageCapture<'_>) -> anyhow::Result<CaptureRecord> {
        let dir = self.window_dir(capture.since);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture directory {}", dir.display()))?;

        let sha256 = hex::encode(Sha256::digest(capture.body));
        let body_file = format!(
            "page-{:04}.{}.json",
            capture.page,
            &sha256[..HASH_PREFIX_LEN]
        );
        let body_path = dir.join(&body_file);
        let repeated = fs::try_exists(&body_path)
            .await
            .with_context(|| format!("checking {}", body_path.display()))?;
        if !repeated {
            write_body(&body_path, capture.body).await?;
        }

        let record = CaptureRecord {
            since: capture.since,
            page: capture.page,
            endpoint: capture.endpoint.to_string(),
            fetched_at: capture.fetched_at,
            sha256,
            byte_size: capture.body.len(),
            body_file,
            repeated,
        };
        append_capture(&dir.join(CAPTURE_LOG), &record).await?;
        Ok(record)
    }

    /// Capture lines for one window in fetch order; empty when nothing was recorded.
    pub async fn captures(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<CaptureRecord>> {
        let path = self.window_dir(since).join(CAPTURE_LOG);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).with_context(|| format!("parsing {}", path.display()))
            })
            .collect()
    }

    pub async fn read_body(&self, record: &CaptureRecord) -> anyhow::Result<Vec<u8>> {
        let path = self.window_dir(record.since).join(&record.body_file);
        fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

async fn write_body(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    let partial = path.with_extension("partial");
    fs::write(&partial, body)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    fs::rename(&partial, path)
        .await
        .with_context(|| format!("moving {} into place", partial.display()))
}

async fn append_capture(log: &Path, record: &CaptureRecord) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(record).context("encoding capture record")?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .await
        .with_context(|| format!("opening {}", log.display()))?;
    file.write_all(&line)
        .await
        .with_context(|| format!("appending to {}", log.display()))?;
    file.flush().await.context("flushing capture log")
}
