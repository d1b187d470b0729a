//! Inbox directory ingress.
//!
//! Files dropped into the inbox are picked up once their size has held
//! still across two scans, streamed into the pipeline and answered with a
//! JSON receipt under `<inbox>/.receipts/`. A file with a receipt is never
//! offered again.

use crate::daemon::Daemon;
use crate::job::{current_timestamp_ms, FileOffer, JobHandle, MediaKind};
use crate::pipeline::{signalled, PART_SUFFIX};
use crate::queue::SubmitError;
use crate::status::{JobOutcome, StatusSink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directory under the inbox root holding receipts.
pub const RECEIPTS_DIR: &str = ".receipts";

/// Requester prefix marking jobs that came from the inbox.
const REQUESTER_PREFIX: &str = "inbox:";

/// A file found in the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Result of comparing a file's size across two scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    Stable,
    Unstable { previous_size: u64, current_size: u64 },
}

#[inline]
pub fn compare_sizes(previous_size: u64, current_size: u64) -> StabilityResult {
    if previous_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            previous_size,
            current_size,
        }
    }
}

/// Receipt path for `file` relative to `root`.
///
/// `/inbox/sub/a.bin` -> `/inbox/.receipts/sub/a.bin.json`
pub fn receipt_path(root: &Path, file: &Path) -> PathBuf {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let mut name = root.join(RECEIPTS_DIR).join(relative).into_os_string();
    name.push(".json");
    PathBuf::from(name)
}

/// What gets written next to a processed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub file: PathBuf,
    pub job_id: Option<String>,
    pub finished_at_ms: i64,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

async fn write_receipt(root: &Path, receipt: &Receipt) -> io::Result<()> {
    let path = receipt_path(root, &receipt.file);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(receipt)?;
    tokio::fs::write(&path, body).await
}

/// List files in the inbox that are ready to be considered.
///
/// Skips hidden directories (including the receipts directory), hidden
/// files, partial `.part` files and anything that already has a receipt.
pub fn scan_inbox(root: &Path) -> Vec<InboxCandidate> {
    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        // the root itself may be hidden
        entry.depth() == 0
            || entry
                .file_name()
                .to_str()
                .map(|name| !name.starts_with('.'))
                .unwrap_or(false)
    });

    let mut candidates = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PART_SUFFIX))
        {
            continue;
        }
        if receipt_path(root, path).exists() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        candidates.push(InboxCandidate {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
        });
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}

/// Counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub submitted: usize,
    /// Still growing or seen for the first time
    pub unsettled: usize,
    /// Queue full or unreadable, retried on the next scan
    pub deferred: usize,
    /// Refused outright, receipt written
    pub rejected: usize,
}

/// Polls the inbox and submits settled files.
pub struct InboxWatcher {
    daemon: Arc<Daemon>,
    root: PathBuf,
    interval: Duration,
    last_sizes: HashMap<PathBuf, u64>,
    submitted: HashSet<PathBuf>,
}

impl InboxWatcher {
    pub fn new(daemon: Arc<Daemon>, root: PathBuf, interval: Duration) -> Self {
        Self {
            daemon,
            root,
            interval,
            last_sizes: HashMap::new(),
            submitted: HashSet::new(),
        }
    }

    pub async fn scan_once(&mut self) -> Result<ScanReport, SubmitError> {
        let mut report = ScanReport::default();
        let candidates = scan_inbox(&self.root);

        // forget files that got a receipt or vanished
        let present: HashSet<&PathBuf> = candidates.iter().map(|c| &c.path).collect();
        self.submitted.retain(|p| present.contains(p));
        self.last_sizes.retain(|p, _| present.contains(p));

        for candidate in &candidates {
            if self.submitted.contains(&candidate.path) {
                continue;
            }

            let previous = self
                .last_sizes
                .insert(candidate.path.clone(), candidate.size_bytes);
            let settled = previous
                .map(|size| compare_sizes(size, candidate.size_bytes) == StabilityResult::Stable)
                .unwrap_or(false);
            if !settled {
                debug!(path = %candidate.path.display(), size = candidate.size_bytes, "Waiting for file to settle");
                report.unsettled += 1;
                continue;
            }

            match self.submit(candidate).await {
                Ok(None) => report.deferred += 1,
                Ok(Some(handle)) => {
                    info!(path = %candidate.path.display(), job_id = %handle.id, "Inbox file submitted");
                    self.submitted.insert(candidate.path.clone());
                    report.submitted += 1;
                }
                Err(SubmitError::QueueOverflow { .. }) => {
                    debug!(path = %candidate.path.display(), "Queue full, retrying next scan");
                    report.deferred += 1;
                }
                Err(SubmitError::ShuttingDown) => return Err(SubmitError::ShuttingDown),
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "Inbox file rejected");
                    let receipt = Receipt {
                        file: candidate.path.clone(),
                        job_id: None,
                        finished_at_ms: current_timestamp_ms(),
                        outcome: JobOutcome::Failed {
                            reason: e.to_string(),
                            interrupted: false,
                        },
                    };
                    if let Err(e) = write_receipt(&self.root, &receipt).await {
                        warn!(path = %candidate.path.display(), error = %e, "Failed to write receipt");
                    }
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    /// `Ok(None)` when the file could not be opened; the next scan retries.
    async fn submit(&self, candidate: &InboxCandidate) -> Result<Option<JobHandle>, SubmitError> {
        let file = match tokio::fs::File::open(&candidate.path).await {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %candidate.path.display(), error = %e, "Inbox file not readable");
                return Ok(None);
            }
        };

        let relative = candidate
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&candidate.path);
        let name = candidate
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        self.daemon
            .submit(FileOffer::new(
                MediaKind::from_path(&candidate.path),
                name,
                candidate.size_bytes,
                Box::new(file),
                format!("{}{}", REQUESTER_PREFIX, relative.display()),
            ))
            .await
            .map(Some)
    }

    /// Scan every interval until `shutdown` turns true or the pipeline
    /// stops accepting work.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.root.display(), interval_secs = self.interval.as_secs_f64(), "Inbox watcher started");
        loop {
            match self.scan_once().await {
                Ok(report) if report != ScanReport::default() => debug!(
                    submitted = report.submitted,
                    unsettled = report.unsettled,
                    deferred = report.deferred,
                    rejected = report.rejected,
                    "Inbox scan"
                ),
                Ok(_) => {}
                Err(_) => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = signalled(&mut shutdown) => break,
            }
        }
        info!("Inbox watcher stopped");
    }
}

/// Status sink that writes receipts for inbox jobs and forwards everything
/// to an inner sink.
pub struct InboxSink {
    root: PathBuf,
    remove_after_publish: bool,
    inner: Arc<dyn StatusSink>,
}

impl InboxSink {
    pub fn new(root: PathBuf, remove_after_publish: bool, inner: Arc<dyn StatusSink>) -> Self {
        Self {
            root,
            remove_after_publish,
            inner,
        }
    }

    /// Inbox file behind `handle`, if it names one inside the inbox.
    fn source_path(&self, handle: &JobHandle) -> Option<PathBuf> {
        let relative = Path::new(handle.requester.strip_prefix(REQUESTER_PREFIX)?);
        let mut components = relative.components().peekable();
        components.peek()?;
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            warn!(requester = %handle.requester, "Ignoring inbox requester outside the inbox");
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl StatusSink for InboxSink {
    async fn update(&self, handle: &JobHandle, text: &str) {
        self.inner.update(handle, text).await;
    }

    async fn finalize(&self, handle: &JobHandle, outcome: &JobOutcome) {
        if let Some(file) = self.source_path(handle) {
            // leave interrupted files for the next run
            let interrupted = matches!(outcome, JobOutcome::Failed { interrupted: true, .. });
            if !interrupted {
                let receipt = Receipt {
                    file: file.clone(),
                    job_id: Some(handle.id.clone()),
                    finished_at_ms: current_timestamp_ms(),
                    outcome: outcome.clone(),
                };
                if let Err(e) = write_receipt(&self.root, &receipt).await {
                    warn!(path = %file.display(), error = %e, "Failed to write receipt");
                }
            }

            if outcome.is_success() && self.remove_after_publish {
                if let Err(e) = tokio::fs::remove_file(&file).await {
                    warn!(path = %file.display(), error = %e, "Failed to remove published inbox file");
                }
            }
        }

        self.inner.finalize(handle, outcome).await;
    }
}
