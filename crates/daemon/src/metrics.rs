//! Metrics module for the seed daemon
//!
//! Provides structs for per-job progress and aggregate pipeline counters
//! with JSON serialization support.

use crate::job::JobStage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job progress while a job holds a worker slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub file_name: String,
    pub stage: JobStage,
    pub declared_size: u64,
    pub started_at_unix_ms: i64,
}

/// Complete metrics snapshot including in-flight jobs and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub submitted_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Offers refused at submit time (overflow, too large, shutting down)
    pub rejected_jobs: u64,
    pub bytes_ingested: u64,
    pub seeding: usize,
    pub last_tick_unix_ms: Option<i64>,
}

impl MetricsSnapshot {
    /// Insert or replace the entry for `job.id`.
    pub fn upsert_job(&mut self, job: JobMetrics) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
        } else {
            self.jobs.push(job);
        }
        self.running_jobs = self.jobs.len();
    }

    pub fn set_stage(&mut self, job_id: &str, stage: JobStage) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) {
            job.stage = stage;
        }
    }

    /// Drop the job from the in-flight list and bump the terminal counters.
    pub fn finish_job(&mut self, job_id: &str, succeeded: bool, bytes: u64) {
        self.jobs.retain(|j| j.id != job_id);
        self.running_jobs = self.jobs.len();
        if succeeded {
            self.completed_jobs += 1;
            self.bytes_ingested += bytes;
        } else {
            self.failed_jobs += 1;
        }
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(id: &str, stage: JobStage) -> JobMetrics {
        JobMetrics {
            id: id.to_string(),
            file_name: format!("{}.bin", id),
            stage,
            declared_size: 1024,
            started_at_unix_ms: 1,
        }
    }

    #[test]
    fn test_upsert_replaces_existing_job() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.upsert_job(job("a", JobStage::Transferring));
        snapshot.upsert_job(job("b", JobStage::Transferring));
        snapshot.upsert_job(job("a", JobStage::Building));

        assert_eq!(snapshot.jobs.len(), 2);
        assert_eq!(snapshot.running_jobs, 2);
        assert_eq!(snapshot.jobs[0].stage, JobStage::Building);

        snapshot.set_stage("b", JobStage::Registering);
        assert_eq!(snapshot.jobs[1].stage, JobStage::Registering);
    }

    #[test]
    fn test_finish_job_updates_counters() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.upsert_job(job("ok", JobStage::Recording));
        snapshot.upsert_job(job("bad", JobStage::Building));

        snapshot.finish_job("ok", true, 4096);
        snapshot.finish_job("bad", false, 1024);

        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.running_jobs, 0);
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.bytes_ingested, 4096);
    }

    #[tokio::test]
    async fn test_shared_metrics_default() {
        let metrics = new_shared_metrics();
        let snapshot = metrics.read().await;
        assert_eq!(*snapshot, MetricsSnapshot::default());
        assert!(snapshot.last_tick_unix_ms.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_json_shape(
            queue_len in 0usize..1000,
            completed in any::<u64>(),
            failed in any::<u64>(),
            seeding in 0usize..500,
            job_count in 0usize..5,
        ) {
            let snapshot = MetricsSnapshot {
                timestamp_unix_ms: 1_700_000_000_000,
                jobs: (0..job_count).map(|i| job(&format!("job-{}", i), JobStage::Building)).collect(),
                queue_len,
                running_jobs: job_count,
                completed_jobs: completed,
                failed_jobs: failed,
                seeding,
                ..MetricsSnapshot::default()
            };

            let json = serde_json::to_value(&snapshot).unwrap();
            prop_assert_eq!(json["queue_len"].as_u64(), Some(queue_len as u64));
            prop_assert_eq!(json["completed_jobs"].as_u64(), Some(completed));
            prop_assert_eq!(json["jobs"].as_array().map(|a| a.len()), Some(job_count));
            if job_count > 0 {
                prop_assert_eq!(json["jobs"][0]["stage"].as_str(), Some("building"));
            }

            let parsed: MetricsSnapshot = serde_json::from_value(json).unwrap();
            prop_assert_eq!(parsed, snapshot);
        }
    }
}
