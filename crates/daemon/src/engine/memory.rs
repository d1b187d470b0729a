//! Loopback engine: keeps handles in memory and never touches the network.
//!
//! Used by the shipped binary when no network engine is plugged in, and by
//! tests, which can invalidate handles or reset their limits to mimic an
//! engine tearing down or silently resetting torrents.

use super::{
    DistributionEngine, EngineError, EngineHandle, EngineState, HandleStatus, Limit,
    PolicyEnforcementError, PolicyLimits, RegistrationFlags, SeedPolicy, SeedRegistrationError,
};
use crate::builder::{ContentId, TorrentArtifact};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Limits a fresh handle starts with, before any policy is applied.
pub const ENGINE_DEFAULT_LIMITS: PolicyLimits = PolicyLimits {
    upload_slots: Limit::Max(8),
    connections: Limit::Max(200),
    upload_rate: Limit::Unlimited,
};

#[derive(Debug)]
struct HandleState {
    state: EngineState,
    valid: bool,
    limits: PolicyLimits,
}

/// In-memory handle.
#[derive(Debug)]
pub struct MemoryHandle {
    content_id: ContentId,
    name: String,
    save_path: PathBuf,
    inner: Mutex<HandleState>,
    announces: AtomicU64,
}

impl MemoryHandle {
    fn new(artifact: &TorrentArtifact, save_path: &Path, flags: RegistrationFlags) -> Self {
        let state = if flags.seed_mode {
            EngineState::Seeding
        } else {
            EngineState::Checking
        };
        Self {
            content_id: artifact.content_id,
            name: artifact.name.clone(),
            save_path: save_path.to_path_buf(),
            inner: Mutex::new(HandleState {
                state,
                valid: true,
                limits: ENGINE_DEFAULT_LIMITS,
            }),
            announces: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Number of announces forced so far.
    pub fn announce_count(&self) -> u64 {
        self.announces.load(Ordering::SeqCst)
    }

    async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.valid = false;
        inner.state = EngineState::Error;
    }
}

#[async_trait]
impl EngineHandle for MemoryHandle {
    fn content_id(&self) -> ContentId {
        self.content_id
    }

    async fn apply_policy(&self, policy: &SeedPolicy) -> Result<(), PolicyEnforcementError> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.valid {
                return Err(PolicyEnforcementError::InvalidHandle(self.content_id));
            }
            inner.limits = policy.limits;
        }

        if policy.force_reannounce {
            self.force_announce()
                .await
                .map_err(|_| PolicyEnforcementError::InvalidHandle(self.content_id))?;
        }
        Ok(())
    }

    async fn status(&self) -> Result<HandleStatus, EngineError> {
        let inner = self.inner.lock().await;
        if !inner.valid {
            return Err(EngineError::InvalidHandle(self.content_id));
        }
        Ok(HandleStatus {
            state: inner.state,
            peer_count: 0,
            seed_count: 0,
            bytes_uploaded: 0,
            limits: inner.limits,
        })
    }

    async fn is_valid(&self) -> bool {
        self.inner.lock().await.valid
    }

    async fn force_announce(&self) -> Result<(), EngineError> {
        if !self.is_valid().await {
            return Err(EngineError::InvalidHandle(self.content_id));
        }
        self.announces.fetch_add(1, Ordering::SeqCst);
        debug!(content_id = %self.content_id, "Announced");
        Ok(())
    }
}

/// Loopback [`DistributionEngine`].
#[derive(Debug, Default)]
pub struct MemoryEngine {
    handles: Mutex<HashMap<ContentId, Arc<MemoryHandle>>>,
    stopped: AtomicBool,
    reject_reason: Mutex<Option<String>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn handle(&self, id: &ContentId) -> Option<Arc<MemoryHandle>> {
        self.handles.lock().await.get(id).cloned()
    }

    pub async fn registered_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Tear a handle down engine-side. Returns false if it was unknown.
    pub async fn invalidate(&self, id: &ContentId) -> bool {
        let handle = self.handles.lock().await.remove(id);
        match handle {
            Some(handle) => {
                handle.invalidate().await;
                true
            }
            None => false,
        }
    }

    /// Silently restore default limits, as some engines do after a recheck.
    pub async fn reset_limits(&self, id: &ContentId) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        handle.inner.lock().await.limits = ENGINE_DEFAULT_LIMITS;
        true
    }

    pub async fn set_state(&self, id: &ContentId, state: EngineState) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        handle.inner.lock().await.state = state;
        true
    }

    /// Make every following registration fail with `reason` (or succeed again with `None`).
    pub async fn reject_registrations(&self, reason: Option<String>) {
        *self.reject_reason.lock().await = reason;
    }
}

#[async_trait]
impl DistributionEngine for MemoryEngine {
    async fn register(
        &self,
        artifact: &TorrentArtifact,
        save_path: &Path,
        flags: RegistrationFlags,
    ) -> Result<Arc<dyn EngineHandle>, SeedRegistrationError> {
        if self.is_shut_down() {
            return Err(SeedRegistrationError::EngineStopped);
        }
        if let Some(reason) = self.reject_reason.lock().await.clone() {
            return Err(SeedRegistrationError::Rejected(reason));
        }

        let data_path = save_path.join(&artifact.name);
        let on_disk = tokio::fs::metadata(&data_path).await.map(|m| m.len()).ok();
        if on_disk != Some(artifact.file_size) {
            return Err(SeedRegistrationError::MissingData(data_path));
        }

        let mut handles = self.handles.lock().await;
        if handles.contains_key(&artifact.content_id) {
            return Err(SeedRegistrationError::AlreadyRegistered(artifact.content_id));
        }

        let handle = Arc::new(MemoryHandle::new(artifact, save_path, flags));
        handles.insert(artifact.content_id, handle.clone());

        info!(
            content_id = %artifact.content_id,
            name = %artifact.name,
            seed_mode = flags.seed_mode,
            upload_only = flags.upload_only,
            "Registered torrent"
        );
        Ok(handle)
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.invalidate().await;
        }
        info!(released = drained.len(), "Engine shut down");
    }
}
