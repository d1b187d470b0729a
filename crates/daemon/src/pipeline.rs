//! Worker pool for the seed daemon
//!
//! Runs admitted jobs through transfer, build, registration and recording.
//! Each job holds one worker slot from the [`JobQueue`] for its whole life and
//! hands it back when its final status has been delivered.

use crate::builder::{ArtifactBuildError, ArtifactBuilder, ContentId, TorrentArtifact};
use crate::engine::{DistributionEngine, RegistrationFlags, SeedPolicy, SeedRegistrationError};
use crate::job::{current_timestamp_ms, ByteSource, IngestionJob, JobHandle, JobStage};
use crate::metrics::{JobMetrics, SharedMetrics};
use crate::queue::{Admission, JobQueue};
use crate::registry::{RegistryError, SeedEntry, SeedingRegistry};
use crate::status::{JobOutcome, PublishedArtifact, StatusSink};
use crate::store::{OutcomeRecord, OutcomeRecorder};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Suffix of files still being received.
pub const PART_SUFFIX: &str = ".part";

/// Staging path for `file_name` inside a job directory.
///
/// The leading dot keeps it apart from every sanitized name, which never
/// starts with one.
pub fn partial_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!(".{}{}", file_name, PART_SUFFIX))
}

/// True for names produced by [`partial_path`].
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

/// Ingress stream failure.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Stream read failed: {0}")]
    Stream(io::Error),

    #[error("Local write failed: {0}")]
    Io(io::Error),

    #[error("Received {received} bytes, expected {declared}")]
    SizeMismatch { declared: u64, received: u64 },
}

/// Error type for a single job's pipeline stages
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Torrent creation failed: {0}")]
    Build(#[from] ArtifactBuildError),

    #[error("Failed to write torrent file: {0}")]
    Descriptor(io::Error),

    #[error("Registration failed: {0}")]
    Registration(#[from] SeedRegistrationError),

    #[error("Registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Settings for the worker pool
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Received files live in `<seed_dir>/<job-id>/`
    pub seed_dir: PathBuf,
    pub torrent_dir: PathBuf,
    /// Deadline for transfer + build
    pub job_timeout: Option<Duration>,
    pub policy: SeedPolicy,
    pub hashing_threads: u32,
    pub builder: ArtifactBuilder,
}

/// Path of the persisted descriptor for `id`.
pub fn descriptor_path(torrent_dir: &Path, id: &ContentId) -> PathBuf {
    torrent_dir.join(format!("{}.torrent", id))
}

/// Removes a failed job's files when dropped, including on panic.
struct Scratch {
    job_dir: PathBuf,
    descriptor: Option<PathBuf>,
    keep: bool,
}

impl Scratch {
    fn new(job_dir: PathBuf) -> Self {
        Self {
            job_dir,
            descriptor: None,
            keep: false,
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Some(descriptor) = &self.descriptor {
            let _ = std::fs::remove_file(descriptor);
        }
        if let Err(e) = std::fs::remove_dir_all(&self.job_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.job_dir.display(), error = %e, "Failed to clean up job directory");
            }
        }
    }
}

/// Worker pool that executes admitted jobs with a bounded number of slots
pub struct WorkerPool {
    settings: PipelineSettings,
    engine: Arc<dyn DistributionEngine>,
    recorder: Arc<OutcomeRecorder>,
    sink: Arc<dyn StatusSink>,
    registry: Arc<SeedingRegistry>,
    queue: Arc<JobQueue>,
    metrics: SharedMetrics,
    /// Bounds concurrent piece hashing
    hashing: Arc<Semaphore>,
    /// Held from the duplicate check until the registry insert
    registration: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(
        settings: PipelineSettings,
        engine: Arc<dyn DistributionEngine>,
        recorder: Arc<OutcomeRecorder>,
        sink: Arc<dyn StatusSink>,
        registry: Arc<SeedingRegistry>,
        queue: Arc<JobQueue>,
        metrics: SharedMetrics,
    ) -> Self {
        let hashing = Arc::new(Semaphore::new(settings.hashing_threads.max(1) as usize));
        let (cancel, _) = watch::channel(false);
        Self {
            settings,
            engine,
            recorder,
            sink,
            registry,
            queue,
            metrics,
            hashing,
            registration: Mutex::new(()),
            cancel,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<SeedingRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start a worker for every job that fits into a free slot.
    ///
    /// Called after each submit, after each job completes and on every
    /// reconciliation tick. Returns the number of jobs admitted.
    pub fn admit(self: &Arc<Self>) -> usize {
        let admissions = self.queue.admit();
        let count = admissions.len();
        for admission in admissions {
            tokio::spawn(self.clone().supervise(admission));
        }
        count
    }

    /// Ask every in-flight job to stop at its next checkpoint.
    pub fn cancel_in_flight(&self) {
        self.cancel.send_replace(true);
    }

    /// Finalize every job still waiting for a slot as failed.
    pub async fn fail_waiting(&self, reason: &str) -> usize {
        let jobs = self.queue.drain_waiting();
        for job in &jobs {
            let handle = job.handle();
            let outcome = JobOutcome::Failed {
                reason: reason.to_string(),
                interrupted: true,
            };
            self.recorder.record(outcome_record(
                &handle,
                &job.file_name,
                job.declared_size,
                0,
                &outcome,
            ));
            self.metrics.write().await.finish_job(&handle.id, false, 0);
            self.sink.finalize(&handle, &outcome).await;
        }
        jobs.len()
    }

    /// Owns the slot, runs the job in its own task and reports exactly once.
    async fn supervise(self: Arc<Self>, admission: Admission) {
        let Admission { job, permit } = admission;
        let handle = job.handle();
        let file_name = job.file_name.clone();
        let declared_size = job.declared_size;
        let started = Instant::now();

        self.metrics.write().await.upsert_job(JobMetrics {
            id: handle.id.clone(),
            file_name: file_name.clone(),
            stage: JobStage::Admitted,
            declared_size,
            started_at_unix_ms: current_timestamp_ms(),
        });
        info!(job_id = %handle.id, file = %file_name, size = declared_size, "Job admitted");

        let worker = tokio::spawn(self.clone().run_job(job));
        let result = match worker.await {
            Ok(result) => result,
            Err(join_err) => Err(JobError::Panicked(join_err.to_string())),
        };

        let outcome = match result {
            Ok(published) => {
                info!(
                    job_id = %handle.id,
                    content_id = %published.content_id,
                    duplicate = published.duplicate,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job complete"
                );
                JobOutcome::Published(published)
            }
            Err(e) => {
                warn!(job_id = %handle.id, error = %e, "Job failed");
                JobOutcome::Failed {
                    reason: e.to_string(),
                    interrupted: matches!(e, JobError::Cancelled),
                }
            }
        };

        self.metrics
            .write()
            .await
            .set_stage(&handle.id, JobStage::Recording);
        self.recorder.record(outcome_record(
            &handle,
            &file_name,
            declared_size,
            started.elapsed().as_millis() as u64,
            &outcome,
        ));

        {
            let mut metrics = self.metrics.write().await;
            metrics.finish_job(&handle.id, outcome.is_success(), declared_size);
        }
        self.sink.finalize(&handle, &outcome).await;

        drop(permit);
        self.admit();
    }

    async fn run_job(self: Arc<Self>, job: IngestionJob) -> Result<PublishedArtifact, JobError> {
        let handle = job.handle();
        let IngestionJob {
            id,
            file_name,
            declared_size,
            source,
            ..
        } = job;

        let job_dir = self.settings.seed_dir.join(&id);
        let mut scratch = Scratch::new(job_dir.clone());

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let prepare = self.transfer_and_build(
            &handle,
            source,
            &job_dir,
            &file_name,
            declared_size,
            cancel_flag.clone(),
        );
        let deadline = self.settings.job_timeout;
        let bounded = async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, prepare)
                    .await
                    .unwrap_or(Err(JobError::TimedOut(limit))),
                None => prepare.await,
            }
        };

        let mut cancel_rx = self.cancel.subscribe();
        let prepared = tokio::select! {
            result = bounded => result,
            _ = signalled(&mut cancel_rx) => Err(JobError::Cancelled),
        };
        if prepared.is_err() {
            // stop a hashing task that may still be running
            cancel_flag.store(true, Ordering::SeqCst);
        }
        let artifact = prepared?;

        // identical uploads finishing together must not both register
        let _registering = self.registration.lock().await;

        if let Some(published) = self.existing_entry(&id, &artifact).await {
            return Ok(published);
        }

        self.enter_stage(&handle, JobStage::Registering, "Registering for seeding")
            .await;
        let descriptor = persist_descriptor(&self.settings.torrent_dir, &artifact, &id)
            .await
            .map_err(JobError::Descriptor)?;
        scratch.descriptor = Some(descriptor.clone());

        let engine_handle = match self
            .engine
            .register(&artifact, artifact.save_dir(), RegistrationFlags::seeding())
            .await
        {
            Ok(engine_handle) => engine_handle,
            Err(e @ SeedRegistrationError::AlreadyRegistered(_)) => {
                // the descriptor on disk belongs to the entry that is already seeding
                scratch.descriptor = None;
                return match self.existing_entry(&id, &artifact).await {
                    Some(published) => Ok(published),
                    None => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let policy_applied_at = match engine_handle.apply_policy(&self.settings.policy).await {
            Ok(()) => Some(current_timestamp_ms()),
            Err(e) => {
                warn!(job_id = %id, content_id = %artifact.content_id, error = %e, "Initial policy not applied, next tick will retry");
                None
            }
        };

        self.registry
            .insert(SeedEntry {
                content_id: artifact.content_id,
                handle: engine_handle,
                display_name: artifact.name.clone(),
                magnet_uri: artifact.magnet_uri.clone(),
                size_bytes: artifact.file_size,
                descriptor_path: descriptor.clone(),
                registered_at_ms: current_timestamp_ms(),
                last_policy_applied_at_ms: policy_applied_at,
            })
            .await?;
        scratch.keep = true;

        Ok(PublishedArtifact {
            content_id: artifact.content_id,
            name: artifact.name.clone(),
            size_bytes: artifact.file_size,
            piece_size: artifact.piece_size,
            piece_count: artifact.piece_count(),
            magnet_uri: artifact.magnet_uri,
            descriptor_path: descriptor,
            duplicate: false,
        })
    }

    /// The published view of an entry already seeding `artifact`'s content.
    async fn existing_entry(&self, job_id: &str, artifact: &TorrentArtifact) -> Option<PublishedArtifact> {
        let existing = self.registry.get_summary(&artifact.content_id).await?;
        info!(job_id = %job_id, content_id = %artifact.content_id, "Content already seeding, dropping duplicate copy");
        Some(PublishedArtifact {
            content_id: existing.content_id,
            name: existing.display_name,
            size_bytes: existing.size_bytes,
            piece_size: artifact.piece_size,
            piece_count: artifact.piece_count(),
            magnet_uri: existing.magnet_uri,
            descriptor_path: descriptor_path(&self.settings.torrent_dir, &existing.content_id),
            duplicate: true,
        })
    }

    async fn transfer_and_build(
        &self,
        handle: &JobHandle,
        source: ByteSource,
        job_dir: &Path,
        file_name: &str,
        declared_size: u64,
        cancel: Arc<AtomicBool>,
    ) -> Result<TorrentArtifact, JobError> {
        self.enter_stage(handle, JobStage::Transferring, &format!("Receiving {}", file_name))
            .await;
        let path = receive_file(source, job_dir, file_name, declared_size).await?;

        self.enter_stage(handle, JobStage::Building, "Creating torrent")
            .await;
        let permit = self
            .hashing
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::Cancelled)?;
        let builder = self.settings.builder.clone();

        let artifact = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            builder.build_cancellable(&path, declared_size, &cancel)
        })
        .await
        .map_err(|e| JobError::Panicked(e.to_string()))??;

        debug!(
            job_id = %handle.id,
            content_id = %artifact.content_id,
            pieces = artifact.piece_count(),
            piece_size = artifact.piece_size,
            "Torrent created"
        );
        Ok(artifact)
    }

    async fn enter_stage(&self, handle: &JobHandle, stage: JobStage, text: &str) {
        self.metrics.write().await.set_stage(&handle.id, stage);
        debug!(job_id = %handle.id, stage = %stage, "Entering stage");
        self.sink.update(handle, text).await;
    }
}

/// Resolves once the flag behind `rx` turns true.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Stream `source` into `<dir>/<file_name>`, going through a hidden `.part` file.
pub async fn receive_file(
    source: ByteSource,
    dir: &Path,
    file_name: &str,
    declared_size: u64,
) -> Result<PathBuf, TransferError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(TransferError::Io)?;

    let partial = partial_path(dir, file_name);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(TransferError::Io)?;

    // One extra byte is enough to detect an oversized stream
    let mut limited = source.take(declared_size.saturating_add(1));
    let received = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(TransferError::Stream)?;
    file.flush().await.map_err(TransferError::Io)?;
    drop(file);

    if received != declared_size {
        return Err(TransferError::SizeMismatch {
            declared: declared_size,
            received,
        });
    }

    let target = dir.join(file_name);
    tokio::fs::rename(&partial, &target)
        .await
        .map_err(TransferError::Io)?;
    Ok(target)
}

async fn persist_descriptor(
    torrent_dir: &Path,
    artifact: &TorrentArtifact,
    job_id: &str,
) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(torrent_dir).await?;
    let target = descriptor_path(torrent_dir, &artifact.content_id);
    let temp = torrent_dir.join(format!(".{}.{}.tmp", artifact.content_id, job_id));

    tokio::fs::write(&temp, &artifact.descriptor).await?;
    if let Err(e) = tokio::fs::rename(&temp, &target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(target)
}

fn outcome_record(
    handle: &JobHandle,
    file_name: &str,
    file_size: u64,
    processing_ms: u64,
    outcome: &JobOutcome,
) -> OutcomeRecord {
    let (content_id, magnet_uri, error) = match outcome {
        JobOutcome::Published(p) => (Some(p.content_id), Some(p.magnet_uri.clone()), None),
        JobOutcome::Failed { reason, .. } => (None, None, Some(reason.clone())),
    };
    OutcomeRecord {
        job_id: handle.id.clone(),
        content_id,
        file_name: file_name.to_string(),
        file_size,
        magnet_uri,
        requester: handle.requester.clone(),
        created_at_ms: current_timestamp_ms(),
        processing_ms,
        succeeded: outcome.is_success(),
        error,
    }
}
