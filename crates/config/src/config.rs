//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but violates a constraint
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Smallest piece size accepted by validation.
pub const MIN_PIECE_SIZE: u64 = 16 * KIB;

/// Public trackers announced in every descriptor unless overridden.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.moeking.me:6969/announce",
];

/// Worker pool and queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Maximum concurrently admitted jobs (0 = default of 3)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Maximum number of jobs waiting for a worker slot
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Piece hashing threads (0 = derive from CPU count)
    #[serde(default)]
    pub hashing_threads: u32,
    /// Deadline for transfer + build of a single job
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    /// Offers larger than this are rejected at submit time
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_file_size_bytes() -> u64 {
    4 * GIB
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            queue_capacity: default_queue_capacity(),
            hashing_threads: 0,
            job_timeout_secs: None,
            max_file_size_bytes: default_max_file_size_bytes(),
        }
    }
}

/// Filesystem locations used by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root for seeded data; each job gets its own subdirectory
    #[serde(default = "default_seed_dir")]
    pub seed_dir: PathBuf,
    /// Where `.torrent` descriptors are written
    #[serde(default = "default_torrent_dir")]
    pub torrent_dir: PathBuf,
    /// Drop folder watched by the inbox ingress (disabled when unset)
    #[serde(default)]
    pub inbox_dir: Option<PathBuf>,
    /// JSON-lines outcome log
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

fn default_seed_dir() -> PathBuf {
    PathBuf::from("/srv/seeds")
}

fn default_torrent_dir() -> PathBuf {
    PathBuf::from("/srv/torrents")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/srv/outcomes.jsonl")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            seed_dir: default_seed_dir(),
            torrent_dir: default_torrent_dir(),
            inbox_dir: None,
            store_path: default_store_path(),
        }
    }
}

/// Reconciliation loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Pause after a failed tick before the next one
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Longest a single entry's engine calls may take within a tick
    #[serde(default = "default_entry_timeout_secs")]
    pub entry_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_entry_timeout_secs() -> u64 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            backoff_secs: default_backoff_secs(),
            entry_timeout_secs: default_entry_timeout_secs(),
        }
    }
}

/// One row of the piece-size table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PieceTier {
    /// Files strictly smaller than this use `piece_size`
    pub below_bytes: u64,
    pub piece_size: u64,
}

/// Descriptor contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentConfig {
    /// Tracker URLs; each one becomes its own tier
    #[serde(default = "default_trackers")]
    pub trackers: Vec<String>,
    #[serde(default = "default_creator")]
    pub creator: String,
    #[serde(default = "default_comment")]
    pub comment: String,
    #[serde(default = "default_piece_tiers")]
    pub piece_tiers: Vec<PieceTier>,
    /// Piece size for files at or above every tier threshold
    #[serde(default = "default_fallback_piece_size")]
    pub fallback_piece_size: u64,
}

fn default_trackers() -> Vec<String> {
    DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect()
}

fn default_creator() -> String {
    "seed-daemon".to_string()
}

fn default_comment() -> String {
    "Published by seed-daemon".to_string()
}

fn default_piece_tiers() -> Vec<PieceTier> {
    vec![
        PieceTier {
            below_bytes: 100 * MIB,
            piece_size: 256 * KIB,
        },
        PieceTier {
            below_bytes: 500 * MIB,
            piece_size: 512 * KIB,
        },
        PieceTier {
            below_bytes: GIB,
            piece_size: MIB,
        },
    ]
}

fn default_fallback_piece_size() -> u64 {
    2 * MIB
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            trackers: default_trackers(),
            creator: default_creator(),
            comment: default_comment(),
            piece_tiers: default_piece_tiers(),
            fallback_piece_size: default_fallback_piece_size(),
        }
    }
}

/// Read-only query HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind: default_bind(),
        }
    }
}

/// Drop-folder ingress behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Delete the inbox file once its torrent is published
    #[serde(default)]
    pub remove_after_publish: bool,
}

fn default_scan_interval_secs() -> u64 {
    5
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            remove_after_publish: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub torrent: TorrentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SEED_MAX_CONCURRENT_JOBS -> pipeline.max_concurrent_jobs
    /// - SEED_QUEUE_CAPACITY -> pipeline.queue_capacity
    /// - SEED_JOB_TIMEOUT_SECS -> pipeline.job_timeout_secs
    /// - SEED_DIR -> paths.seed_dir
    /// - SEED_TORRENT_DIR -> paths.torrent_dir
    /// - SEED_INBOX_DIR -> paths.inbox_dir
    /// - SEED_STORE_PATH -> paths.store_path
    /// - SEED_RECONCILE_INTERVAL_SECS -> reconcile.interval_secs
    /// - SEED_SERVER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SEED_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.pipeline.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("SEED_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                self.pipeline.queue_capacity = capacity;
            }
        }

        if let Ok(val) = env::var("SEED_JOB_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.pipeline.job_timeout_secs = Some(secs);
            }
        }

        if let Ok(val) = env::var("SEED_DIR") {
            if !val.is_empty() {
                self.paths.seed_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SEED_TORRENT_DIR") {
            if !val.is_empty() {
                self.paths.torrent_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SEED_INBOX_DIR") {
            if !val.is_empty() {
                self.paths.inbox_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("SEED_STORE_PATH") {
            if !val.is_empty() {
                self.paths.store_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SEED_RECONCILE_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.reconcile.interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("SEED_SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconcile.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.pipeline.job_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "pipeline.job_timeout_secs must be at least 1 (omit it for no deadline)".to_string(),
            ));
        }
        if self.reconcile.entry_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.entry_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.torrent.trackers.is_empty() {
            return Err(ConfigError::Invalid(
                "torrent.trackers must list at least one tracker".to_string(),
            ));
        }

        let mut previous_threshold = 0;
        for tier in &self.torrent.piece_tiers {
            check_piece_size(tier.piece_size)?;
            if tier.below_bytes <= previous_threshold {
                return Err(ConfigError::Invalid(format!(
                    "torrent.piece_tiers thresholds must strictly increase (got {} after {})",
                    tier.below_bytes, previous_threshold
                )));
            }
            previous_threshold = tier.below_bytes;
        }
        check_piece_size(self.torrent.fallback_piece_size)?;

        Ok(())
    }

    /// Load configuration from file, apply environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn check_piece_size(size: u64) -> Result<(), ConfigError> {
    if size < MIN_PIECE_SIZE || !size.is_power_of_two() {
        return Err(ConfigError::Invalid(format!(
            "piece size {} must be a power of two of at least {} bytes",
            size, MIN_PIECE_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "SEED_MAX_CONCURRENT_JOBS",
            "SEED_QUEUE_CAPACITY",
            "SEED_JOB_TIMEOUT_SECS",
            "SEED_DIR",
            "SEED_TORRENT_DIR",
            "SEED_INBOX_DIR",
            "SEED_STORE_PATH",
            "SEED_RECONCILE_INTERVAL_SECS",
            "SEED_SERVER_BIND",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_pipeline_and_reconcile(
            max_jobs in 0u32..16,
            capacity in 1usize..1000,
            timeout in proptest::option::of(1u64..3600),
            interval in 1u64..600,
            backoff in 1u64..600,
        ) {
            let toml_str = format!(
                r#"
[pipeline]
max_concurrent_jobs = {}
queue_capacity = {}
{}

[reconcile]
interval_secs = {}
backoff_secs = {}
"#,
                max_jobs,
                capacity,
                timeout.map(|t| format!("job_timeout_secs = {}", t)).unwrap_or_default(),
                interval,
                backoff,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.pipeline.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.pipeline.queue_capacity, capacity);
            prop_assert_eq!(config.pipeline.job_timeout_secs, timeout);
            prop_assert_eq!(config.reconcile.interval_secs, interval);
            prop_assert_eq!(config.reconcile.backoff_secs, backoff);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[pipeline]
max_concurrent_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SEED_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.pipeline.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_non_power_of_two_piece_size_rejected(size in (16u64 * 1024)..(64 * 1024 * 1024)) {
            prop_assume!(!size.is_power_of_two());
            let mut config = Config::default();
            config.torrent.fallback_piece_size = size;
            prop_assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.pipeline.max_concurrent_jobs, 0);
        assert_eq!(config.pipeline.queue_capacity, 64);
        assert_eq!(config.pipeline.job_timeout_secs, None);
        assert_eq!(config.pipeline.max_file_size_bytes, 4 * GIB);
        assert_eq!(config.paths.seed_dir, PathBuf::from("/srv/seeds"));
        assert_eq!(config.paths.inbox_dir, None);
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.torrent.trackers.len(), 5);
        assert_eq!(config.torrent.piece_tiers.len(), 3);
        assert_eq!(config.torrent.fallback_piece_size, 2 * MIB);
        assert!(config.server.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[paths]
seed_dir = "/data/seeds"
inbox_dir = "/data/inbox"

[torrent]
trackers = ["udp://tracker.example.org:6969/announce"]
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.paths.seed_dir, PathBuf::from("/data/seeds"));
        assert_eq!(config.paths.inbox_dir, Some(PathBuf::from("/data/inbox")));
        assert_eq!(config.paths.torrent_dir, PathBuf::from("/srv/torrents"));
        assert_eq!(config.torrent.trackers.len(), 1);
        assert_eq!(config.torrent.creator, "seed-daemon");
    }

    #[test]
    fn test_env_overrides_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("SEED_DIR", "/mnt/seeds");
        env::set_var("SEED_INBOX_DIR", "/mnt/inbox");
        env::set_var("SEED_JOB_TIMEOUT_SECS", "not-a-number");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.paths.seed_dir, PathBuf::from("/mnt/seeds"));
        assert_eq!(config.paths.inbox_dir, Some(PathBuf::from("/mnt/inbox")));
        // Unparseable value keeps the existing setting
        assert_eq!(config.pipeline.job_timeout_secs, None);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.pipeline.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_job_timeout() {
        let config = Config::parse_toml("[pipeline]\njob_timeout_secs = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config::parse_toml("[pipeline]\njob_timeout_secs = 1\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_entry_timeout() {
        let mut config = Config::default();
        assert_eq!(config.reconcile.entry_timeout_secs, 10);
        config.reconcile.entry_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_trackers() {
        let mut config = Config::default();
        config.torrent.trackers.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_unordered_tiers() {
        let mut config = Config::default();
        config.torrent.piece_tiers.swap(0, 1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
