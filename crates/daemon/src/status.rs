//! Status sink: progress and final results pushed back to the requester.

use crate::builder::ContentId;
use crate::job::JobHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// What a requester gets back for a published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    pub content_id: ContentId,
    pub name: String,
    pub size_bytes: u64,
    pub piece_size: u64,
    pub piece_count: usize,
    pub magnet_uri: String,
    pub descriptor_path: PathBuf,
    /// Content was already seeding; this job reused the existing entry
    pub duplicate: bool,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Published(PublishedArtifact),
    Failed {
        reason: String,
        /// Stopped by shutdown rather than by a fault in the job
        #[serde(default)]
        interrupted: bool,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Published(_))
    }

    pub fn content_id(&self) -> Option<ContentId> {
        match self {
            JobOutcome::Published(artifact) => Some(artifact.content_id),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// Receiver of per-job status text.
///
/// `update` is best-effort and may be dropped; `finalize` is called exactly
/// once per submitted job.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, handle: &JobHandle, text: &str);

    async fn finalize(&self, handle: &JobHandle, outcome: &JobOutcome);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn update(&self, handle: &JobHandle, text: &str) {
        info!(job_id = %handle.id, requester = %handle.requester, "{}", text);
    }

    async fn finalize(&self, handle: &JobHandle, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Published(artifact) => info!(
                job_id = %handle.id,
                requester = %handle.requester,
                content_id = %artifact.content_id,
                magnet = %artifact.magnet_uri,
                "Published {}",
                artifact.name
            ),
            JobOutcome::Failed {
                reason,
                interrupted,
            } => warn!(
                job_id = %handle.id,
                requester = %handle.requester,
                reason = %reason,
                interrupted,
                "Job failed"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::HASH_LEN;
    use std::sync::Mutex;

    /// Collects everything it is told, for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct MemorySink {
        pub updates: Mutex<Vec<(String, String)>>,
        pub finals: Mutex<Vec<(JobHandle, JobOutcome)>>,
    }

    impl MemorySink {
        pub fn finals(&self) -> Vec<(JobHandle, JobOutcome)> {
            self.finals.lock().unwrap().clone()
        }

        pub fn updates_for(&self, job_id: &str) -> Vec<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == job_id)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StatusSink for MemorySink {
        async fn update(&self, handle: &JobHandle, text: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((handle.id.clone(), text.to_string()));
        }

        async fn finalize(&self, handle: &JobHandle, outcome: &JobOutcome) {
            self.finals
                .lock()
                .unwrap()
                .push((handle.clone(), outcome.clone()));
        }
    }

    #[test]
    fn test_outcome_json_is_tagged() {
        let failed = JobOutcome::Failed {
            reason: "disk full".into(),
            interrupted: false,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "disk full");
        assert_eq!(json["interrupted"], false);

        // records written before the flag existed still parse
        let legacy: JobOutcome =
            serde_json::from_str(r#"{"outcome":"failed","reason":"old"}"#).unwrap();
        assert_eq!(
            legacy,
            JobOutcome::Failed {
                reason: "old".into(),
                interrupted: false,
            }
        );
        assert!(!failed.is_success());
        assert_eq!(failed.content_id(), None);

        let published = JobOutcome::Published(PublishedArtifact {
            content_id: ContentId::from_bytes([1; HASH_LEN]),
            name: "a.bin".into(),
            size_bytes: 10,
            piece_size: 262_144,
            piece_count: 1,
            magnet_uri: "magnet:?xt=urn:btih:01".into(),
            descriptor_path: PathBuf::from("/t/01.torrent"),
            duplicate: false,
        });
        let json = serde_json::to_value(&published).unwrap();
        assert_eq!(json["outcome"], "published");
        assert_eq!(json["name"], "a.bin");
        assert!(published.is_success());
    }
}
