//! Daemon facade for the seed daemon
//!
//! Wires the queue, worker pool, registry, reconciliation loop and the
//! engine/store/sink collaborators together, and exposes the submit and
//! query operations used by ingress adapters and the HTTP surface.

use crate::builder::{ArtifactBuilder, BuilderSettings};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::engine::{DistributionEngine, SeedPolicy};
use crate::job::{current_timestamp_ms, FileOffer, IngestionJob, JobHandle};
use crate::metrics::{new_shared_metrics, MetricsSnapshot, SharedMetrics};
use crate::pipeline::{PipelineSettings, WorkerPool};
use crate::queue::{JobQueue, QueueDepth, SubmitError};
use crate::reconcile::Reconciler;
use crate::registry::{SeedSummary, SeedingRegistry};
use crate::startup::{run_startup_checks, StartupError};
use crate::status::StatusSink;
use crate::store::{MetadataStore, OutcomeRecorder, StoreError, StoreSummary};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Reason given to jobs still waiting when the pipeline stops.
pub const SHUTDOWN_REASON: &str = "pipeline shutting down";

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Daemon already started")]
    AlreadyStarted,
}

/// How in-flight jobs are treated on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let running jobs finish
    Drain,
    /// Abort running jobs at their next checkpoint
    Cancel,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    metrics: SharedMetrics,
    pool: Arc<WorkerPool>,
    reconciler: Arc<Reconciler>,
    engine: Arc<dyn DistributionEngine>,
    recorder: Arc<OutcomeRecorder>,
    shutdown_tx: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Initialize the daemon after running startup checks
    ///
    /// Startup checks create and probe the data directories and sweep
    /// leftovers of an interrupted run. Any failure is fatal.
    pub fn with_config(
        config: Config,
        engine: Arc<dyn DistributionEngine>,
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config, engine, store, sink))
    }

    /// Initialize the daemon with configuration from file
    pub fn load<P: AsRef<Path>>(
        config_path: P,
        engine: Arc<dyn DistributionEngine>,
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, engine, store, sink)
    }

    /// Initialize the daemon without running startup checks
    pub fn new_without_checks(
        config: Config,
        engine: Arc<dyn DistributionEngine>,
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let registry = Arc::new(SeedingRegistry::new());
        let queue = Arc::new(JobQueue::new(
            concurrency_plan.max_concurrent_jobs as usize,
            concurrency_plan.queue_capacity,
        ));
        let recorder = Arc::new(OutcomeRecorder::new(store));
        let policy = SeedPolicy::unlimited();

        let settings = PipelineSettings {
            seed_dir: config.paths.seed_dir.clone(),
            torrent_dir: config.paths.torrent_dir.clone(),
            job_timeout: config.pipeline.job_timeout_secs.map(Duration::from_secs),
            policy,
            hashing_threads: concurrency_plan.hashing_threads,
            builder: ArtifactBuilder::new(BuilderSettings::from_config(&config.torrent)),
        };

        let pool = Arc::new(WorkerPool::new(
            settings,
            engine.clone(),
            recorder.clone(),
            sink,
            registry,
            queue,
            metrics.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            pool.clone(),
            metrics.clone(),
            policy,
            Duration::from_secs(config.reconcile.interval_secs.max(1)),
            Duration::from_secs(config.reconcile.backoff_secs),
            Duration::from_secs(config.reconcile.entry_timeout_secs.max(1)),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            concurrency_plan,
            metrics,
            pool,
            reconciler,
            engine,
            recorder,
            shutdown_tx,
            reconcile_task: Mutex::new(None),
        }
    }

    /// Start the reconciliation loop.
    pub async fn start(&self) -> Result<(), DaemonError> {
        let mut task = self.reconcile_task.lock().await;
        if task.is_some() {
            return Err(DaemonError::AlreadyStarted);
        }

        let reconciler = self.reconciler.clone();
        *task = Some(tokio::spawn(reconciler.run(self.shutdown_tx.subscribe())));

        info!(
            max_concurrent_jobs = self.concurrency_plan.max_concurrent_jobs,
            queue_capacity = self.concurrency_plan.queue_capacity,
            hashing_threads = self.concurrency_plan.hashing_threads,
            "Pipeline started"
        );
        Ok(())
    }

    /// Enqueue an offer and try to admit it right away.
    pub async fn submit(&self, offer: FileOffer) -> Result<JobHandle, SubmitError> {
        let limit = self.config.pipeline.max_file_size_bytes;
        if offer.size > limit {
            self.metrics.write().await.rejected_jobs += 1;
            return Err(SubmitError::TooLarge {
                size: offer.size,
                limit,
            });
        }

        let job = IngestionJob::from_offer(offer);
        let handle = job.handle();
        let file_name = job.file_name.clone();

        if let Err(e) = self.pool.queue().push(job) {
            warn!(requester = %handle.requester, file = %file_name, error = %e, "Offer rejected");
            self.metrics.write().await.rejected_jobs += 1;
            return Err(e);
        }
        self.metrics.write().await.submitted_jobs += 1;
        info!(job_id = %handle.id, requester = %handle.requester, file = %file_name, "Job queued");

        self.pool.admit();
        Ok(handle)
    }

    /// Read-only snapshot of everything being seeded.
    pub async fn list_active(&self) -> Vec<SeedSummary> {
        self.pool.registry().list_active().await
    }

    pub fn queue_depth(&self) -> QueueDepth {
        self.pool.queue().depth()
    }

    pub async fn store_summary(&self) -> Result<StoreSummary, StoreError> {
        self.recorder.store().summary().await
    }

    /// Metrics with live queue and registry figures filled in.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let depth = self.queue_depth();
        let seeding = self.pool.registry().len().await;
        let mut snapshot = self.metrics.read().await.clone();
        snapshot.timestamp_unix_ms = current_timestamp_ms();
        snapshot.queue_len = depth.waiting;
        snapshot.seeding = seeding;
        snapshot
    }

    /// Get the shared metrics
    pub fn shared_metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Stop the pipeline.
    ///
    /// Order: stop accepting, fail waiting jobs, drain or cancel running
    /// jobs, stop the reconciliation loop, flush outcome records, and only
    /// then release the engine.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        info!(?mode, "Shutting down pipeline");
        let queue = self.pool.queue();
        queue.close();

        let failed = self.pool.fail_waiting(SHUTDOWN_REASON).await;
        if failed > 0 {
            info!(failed, "Failed jobs still waiting for a slot");
        }

        if mode == ShutdownMode::Cancel {
            self.pool.cancel_in_flight();
        }
        queue.wait_idle().await;

        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.reconcile_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Reconciliation loop ended abnormally");
            }
        }

        self.recorder.flush().await;
        self.engine.shutdown().await;
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::job::MediaKind;
    use crate::pipeline::tests::pattern;
    use crate::status::tests::MemorySink;
    use crate::status::JobOutcome;
    use crate::store::{JsonlStore, NullStore};
    use tempfile::TempDir;

    struct Fixture {
        daemon: Daemon,
        engine: Arc<MemoryEngine>,
        sink: Arc<MemorySink>,
        _dir: TempDir,
    }

    fn fixture(jobs: u32, capacity: usize, max_file_size: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.pipeline.max_concurrent_jobs = jobs;
        config.pipeline.queue_capacity = capacity;
        config.pipeline.max_file_size_bytes = max_file_size;
        config.paths.seed_dir = dir.path().join("seeds");
        config.paths.torrent_dir = dir.path().join("torrents");
        config.paths.store_path = dir.path().join("outcomes.jsonl");
        config.reconcile.interval_secs = 1;

        let engine = Arc::new(MemoryEngine::new());
        let sink = Arc::new(MemorySink::default());
        let store = Arc::new(JsonlStore::new(config.paths.store_path.clone()));
        let daemon = Daemon::with_config(config, engine.clone(), store, sink.clone()).unwrap();
        Fixture {
            daemon,
            engine,
            sink,
            _dir: dir,
        }
    }

    fn offer(name: &str, data: Vec<u8>) -> FileOffer {
        let size = data.len() as u64;
        FileOffer::new(
            MediaKind::Document,
            Some(name.to_string()),
            size,
            Box::new(std::io::Cursor::new(data)),
            "chat:1",
        )
    }

    fn stalled_offer(name: &str, size: u64) -> (FileOffer, tokio::io::DuplexStream) {
        let (reader, writer) = tokio::io::duplex(64);
        (
            FileOffer::new(MediaKind::Video, Some(name.to_string()), size, Box::new(reader), "chat:2"),
            writer,
        )
    }

    async fn wait_for_finals(sink: &MemorySink, count: usize) -> Vec<(JobHandle, JobOutcome)> {
        for _ in 0..500 {
            let finals = sink.finals();
            if finals.len() >= count {
                return finals;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} final statuses", count);
    }

    #[tokio::test]
    async fn test_submit_publishes_and_queries_report_it() {
        let f = fixture(3, 8, u64::MAX);
        f.daemon.start().await.unwrap();

        let handle = f.daemon.submit(offer("a.bin", pattern(10 * 1024 * 1024, 7))).await.unwrap();
        let finals = wait_for_finals(&f.sink, 1).await;

        let (final_handle, outcome) = &finals[0];
        assert_eq!(final_handle, &handle);
        let id = outcome.content_id().unwrap();

        let active = f.daemon.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content_id, id);
        assert_eq!(active[0].size_bytes, 10 * 1024 * 1024);

        let JobOutcome::Published(published) = outcome else {
            panic!("expected success");
        };
        assert_eq!(published.piece_size, 256 * 1024);
        assert_eq!(published.piece_count, 40);

        let metrics = f.daemon.metrics().await;
        assert_eq!(metrics.submitted_jobs, 1);
        assert_eq!(metrics.completed_jobs, 1);
        assert_eq!(metrics.seeding, 1);

        f.daemon.shutdown(ShutdownMode::Drain).await;
        assert_eq!(f.daemon.queue_depth(), QueueDepth { admitted: 0, waiting: 0 });
        let summary = f.daemon.store_summary().await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(f.engine.is_shut_down());
    }

    #[tokio::test]
    async fn test_too_large_rejected_at_submit() {
        let f = fixture(1, 4, 100);
        let err = f.daemon.submit(offer("big.bin", vec![0u8; 101])).await.unwrap_err();

        assert!(matches!(err, SubmitError::TooLarge { size: 101, limit: 100 }));
        assert_eq!(f.daemon.metrics().await.rejected_jobs, 1);
        assert!(f.sink.finals().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_surfaces_synchronously() {
        let f = fixture(1, 1, u64::MAX);
        let (busy, _w1) = stalled_offer("busy.mp4", 10);
        let (waiting, _w2) = stalled_offer("waiting.mp4", 10);
        let (extra, _w3) = stalled_offer("extra.mp4", 10);

        f.daemon.submit(busy).await.unwrap();
        f.daemon.submit(waiting).await.unwrap();
        let err = f.daemon.submit(extra).await.unwrap_err();

        assert!(matches!(err, SubmitError::QueueOverflow { capacity: 1 }));
        assert_eq!(f.daemon.queue_depth(), QueueDepth { admitted: 1, waiting: 1 });

        f.daemon.shutdown(ShutdownMode::Cancel).await;
    }

    #[tokio::test]
    async fn test_drain_shutdown_fails_waiting_and_finishes_running() {
        let f = fixture(1, 4, u64::MAX);
        f.daemon.start().await.unwrap();

        let (running, writer) = stalled_offer("running.mp4", 4);
        let running = f.daemon.submit(running).await.unwrap();
        let waiting = f.daemon.submit(offer("waiting.bin", pattern(10, 1))).await.unwrap();

        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut writer = writer;
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.write_all(b"data").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        f.daemon.shutdown(ShutdownMode::Drain).await;
        feeder.await.unwrap();

        let finals = f.sink.finals();
        assert_eq!(finals.len(), 2);
        let outcome_of = |h: &JobHandle| finals.iter().find(|(fh, _)| fh == h).unwrap().1.clone();
        assert!(outcome_of(&running).is_success());
        assert_eq!(
            outcome_of(&waiting),
            JobOutcome::Failed {
                reason: SHUTDOWN_REASON.into(),
                interrupted: true,
            }
        );

        assert!(matches!(
            f.daemon.submit(offer("late.bin", vec![1])).await,
            Err(SubmitError::ShuttingDown)
        ));
        assert!(f.engine.is_shut_down());
    }

    #[tokio::test]
    async fn test_cancel_shutdown_aborts_running() {
        let f = fixture(2, 4, u64::MAX);
        f.daemon.start().await.unwrap();
        let (stuck, _writer) = stalled_offer("stuck.mp4", 1000);
        f.daemon.submit(stuck).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), f.daemon.shutdown(ShutdownMode::Cancel))
            .await
            .unwrap();

        let finals = f.sink.finals();
        assert_eq!(finals.len(), 1);
        assert!(matches!(finals[0].1, JobOutcome::Failed { interrupted: true, .. }));
        assert!(f.daemon.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let f = fixture(1, 1, u64::MAX);
        f.daemon.start().await.unwrap();
        assert!(matches!(f.daemon.start().await, Err(DaemonError::AlreadyStarted)));
        f.daemon.shutdown(ShutdownMode::Drain).await;
    }

    #[test]
    fn test_daemon_derives_concurrency_plan() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.seed_dir = dir.path().join("s");
        config.pipeline.max_concurrent_jobs = 0;
        config.pipeline.queue_capacity = 5;

        let daemon = Daemon::new_without_checks(
            config,
            Arc::new(MemoryEngine::new()),
            Arc::new(NullStore),
            Arc::new(MemorySink::default()),
        );

        assert_eq!(daemon.concurrency_plan.max_concurrent_jobs, 3);
        assert_eq!(daemon.concurrency_plan.queue_capacity, 5);
        assert!(daemon.concurrency_plan.hashing_threads >= 1);
    }
}
