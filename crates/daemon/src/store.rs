//! Outcome store.
//!
//! One [`OutcomeRecord`] is appended per finished job. Persistence is
//! best-effort: failures are logged once and never reach the job.

use crate::builder::ContentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub job_id: String,
    pub content_id: Option<ContentId>,
    pub file_name: String,
    pub file_size: u64,
    pub magnet_uri: Option<String>,
    pub requester: String,
    pub created_at_ms: i64,
    pub processing_ms: u64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub records: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Bytes across successful records
    pub total_bytes: u64,
}

impl StoreSummary {
    fn add(&mut self, record: &OutcomeRecord) {
        self.records += 1;
        if record.succeeded {
            self.succeeded += 1;
            self.total_bytes += record.file_size;
        } else {
            self.failed += 1;
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn append(&self, record: &OutcomeRecord) -> Result<(), StoreError>;

    async fn summary(&self) -> Result<StoreSummary, StoreError>;
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)?;
    file.flush()
}

fn summarize(path: &Path) -> io::Result<StoreSummary> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreSummary::default()),
        Err(e) => return Err(e),
    };

    let mut summary = StoreSummary::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeRecord>(&line) {
            Ok(record) => summary.add(&record),
            Err(e) => warn!(path = %path.display(), line = index + 1, error = %e, "Skipping malformed outcome record"),
        }
    }
    Ok(summary)
}

#[async_trait]
impl MetadataStore for JsonlStore {
    async fn append(&self, record: &OutcomeRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(())
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let path = self.path.clone();
        let summary = tokio::task::spawn_blocking(move || summarize(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(summary)
    }
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl MetadataStore for NullStore {
    async fn append(&self, _record: &OutcomeRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        Ok(StoreSummary::default())
    }
}

/// Fire-and-forget writer in front of a [`MetadataStore`].
///
/// Appends run in their own tasks; [`flush`](Self::flush) waits for the ones
/// still pending, which shutdown uses so no record is lost on exit.
pub struct OutcomeRecorder {
    store: Arc<dyn MetadataStore>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl OutcomeRecorder {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn record(&self, record: OutcomeRecord) {
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = store.append(&record).await {
                warn!(job_id = %record.job_id, error = %e, "Failed to persist outcome record");
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    pub async fn flush(&self) {
        let pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in pending {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::HASH_LEN;
    use tempfile::TempDir;

    fn record(job_id: &str, succeeded: bool, size: u64) -> OutcomeRecord {
        OutcomeRecord {
            job_id: job_id.to_string(),
            content_id: succeeded.then(|| ContentId::from_bytes([9; HASH_LEN])),
            file_name: format!("{}.bin", job_id),
            file_size: size,
            magnet_uri: succeeded.then(|| "magnet:?xt=urn:btih:09".to_string()),
            requester: "tester".to_string(),
            created_at_ms: 1_700_000_000_000,
            processing_ms: 12,
            succeeded,
            error: (!succeeded).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_jsonl_append_and_summary() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::new(dir.path().join("outcomes.jsonl"));

        store.append(&record("a", true, 100)).await.unwrap();
        store.append(&record("b", true, 50)).await.unwrap();
        store.append(&record("c", false, 999)).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(
            summary,
            StoreSummary {
                records: 3,
                succeeded: 2,
                failed: 1,
                total_bytes: 150,
            }
        );

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().count(), 3);
        let first: OutcomeRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first, record("a", true, 100));
    }

    #[tokio::test]
    async fn test_summary_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::new(dir.path().join("absent.jsonl"));
        assert_eq!(store.summary().await.unwrap(), StoreSummary::default());
    }

    #[tokio::test]
    async fn test_summary_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let good = serde_json::to_string(&record("a", true, 7)).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n", good)).unwrap();

        let summary = JsonlStore::new(&path).summary().await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.total_bytes, 7);
    }

    #[tokio::test]
    async fn test_unwritable_store_is_swallowed_by_recorder() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for appending
        let recorder = OutcomeRecorder::new(Arc::new(JsonlStore::new(dir.path())));

        recorder.record(record("a", true, 1));
        recorder.flush().await;

        let err = recorder.store().append(&record("b", true, 1)).await;
        assert!(matches!(err, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_recorder_flush_persists_pending() {
        let dir = TempDir::new().unwrap();
        let recorder = OutcomeRecorder::new(Arc::new(JsonlStore::new(dir.path().join("o.jsonl"))));

        for i in 0..5 {
            recorder.record(record(&format!("job-{}", i), i % 2 == 0, 10));
        }
        recorder.flush().await;

        let summary = recorder.store().summary().await.unwrap();
        assert_eq!(summary.records, 5);
        assert_eq!(summary.succeeded, 3);
    }

    #[tokio::test]
    async fn test_null_store() {
        let store = NullStore;
        store.append(&record("a", true, 1)).await.unwrap();
        assert_eq!(store.summary().await.unwrap(), StoreSummary::default());
    }
}
