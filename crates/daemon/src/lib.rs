//! Seed Daemon
//!
//! Background service that turns incoming files into BitTorrent descriptors,
//! registers them with a distribution engine for indefinite seeding and keeps
//! the seeding policy enforced.

pub mod bencode;
pub mod builder;
pub mod concurrency;
pub mod daemon;
pub mod engine;
pub mod inbox;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod query_server;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod startup;
pub mod status;
pub mod store;

pub use seed_daemon_config as config;
pub use seed_daemon_config::Config;
pub use builder::{
    select_piece_size, ArtifactBuildError, ArtifactBuilder, BuilderSettings, ContentId,
    PieceSizePolicy, TorrentArtifact,
};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError, ShutdownMode};
pub use engine::{
    DistributionEngine, EngineHandle, EngineState, MemoryEngine, RegistrationFlags, SeedPolicy,
};
pub use inbox::{InboxSink, InboxWatcher};
pub use job::{FileOffer, JobHandle, JobStage, MediaKind};
pub use metrics::{new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics};
pub use pipeline::{JobError, WorkerPool};
pub use query_server::{create_query_router, run_query_server, ServerError};
pub use queue::{QueueDepth, SubmitError};
pub use reconcile::{Reconciler, TickReport};
pub use registry::{SeedSummary, SeedingRegistry};
pub use startup::{run_startup_checks, StartupError, SweepReport};
pub use status::{JobOutcome, LogSink, StatusSink};
pub use store::{JsonlStore, MetadataStore, NullStore, OutcomeRecord, StoreSummary};
