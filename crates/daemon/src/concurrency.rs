//! Concurrency planning module for the seed daemon
//!
//! Derives worker-slot, queue and hashing limits from CPU core count and configuration.

use crate::config::Config;

/// Worker slots used when the configuration leaves `max_concurrent_jobs` at zero.
pub const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 3;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrently admitted jobs (K)
    pub max_concurrent_jobs: u32,
    /// Maximum number of jobs waiting for a worker slot
    pub queue_capacity: usize,
    /// Number of jobs allowed to hash pieces at the same time
    pub hashing_threads: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - K is the explicit `max_concurrent_jobs` if non-zero, otherwise 3
    /// - Hashing threads are explicit if non-zero, otherwise `min(K, cores)`
    /// - Hashing threads are always clamped to `[1, K]`
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`derive`](Self::derive) with a fixed core count.
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);

        let max_concurrent_jobs = if cfg.pipeline.max_concurrent_jobs > 0 {
            cfg.pipeline.max_concurrent_jobs
        } else {
            DEFAULT_MAX_CONCURRENT_JOBS
        };

        let hashing_threads = if cfg.pipeline.hashing_threads > 0 {
            cfg.pipeline.hashing_threads
        } else {
            total_cores.min(max_concurrent_jobs)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
            queue_capacity: cfg.pipeline.queue_capacity.max(1),
            hashing_threads: hashing_threads.clamp(1, max_concurrent_jobs),
        }
    }

    /// Plan with explicit limits, mostly for tests and embedding.
    pub fn fixed(max_concurrent_jobs: u32, queue_capacity: usize) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            total_cores: num_cpus::get() as u32,
            max_concurrent_jobs,
            queue_capacity: queue_capacity.max(1),
            hashing_threads: max_concurrent_jobs,
        }
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
