//! Content-distribution engine seam.
//!
//! The pipeline never speaks a peer protocol itself. It hands finished
//! artifacts to a [`DistributionEngine`] and drives the returned
//! [`EngineHandle`]s from the registry and the reconciliation loop.

mod memory;

pub use memory::{MemoryEngine, MemoryHandle};

use crate::builder::{ContentId, TorrentArtifact};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A bound on an engine resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Max(u32),
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Max(n) => write!(f, "{}", n),
        }
    }
}

/// Resource limits currently in force on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub upload_slots: Limit,
    pub connections: Limit,
    /// Bytes per second
    pub upload_rate: Limit,
}

impl PolicyLimits {
    pub fn unlimited() -> Self {
        Self {
            upload_slots: Limit::Unlimited,
            connections: Limit::Unlimited,
            upload_rate: Limit::Unlimited,
        }
    }
}

/// Seeding policy re-asserted on every active handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPolicy {
    pub limits: PolicyLimits,
    /// Announce to trackers and the DHT right away
    pub force_reannounce: bool,
}

impl SeedPolicy {
    /// Unlimited slots, connections and rate with an immediate re-announce.
    pub fn unlimited() -> Self {
        Self {
            limits: PolicyLimits::unlimited(),
            force_reannounce: true,
        }
    }
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Flags passed when opening a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationFlags {
    /// Treat local data as already verified
    pub seed_mode: bool,
    /// Never download, only serve
    pub upload_only: bool,
}

impl RegistrationFlags {
    pub fn seeding() -> Self {
        Self {
            seed_mode: true,
            upload_only: true,
        }
    }
}

/// Engine-side lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Checking,
    Seeding,
    Paused,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Checking => "checking",
            EngineState::Seeding => "seeding",
            EngineState::Paused => "paused",
            EngineState::Error => "error",
        }
    }

    /// Whether the handle is actively distributing data.
    pub fn is_seeding(&self) -> bool {
        matches!(self, EngineState::Seeding)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleStatus {
    pub state: EngineState,
    pub peer_count: u32,
    pub seed_count: u32,
    pub bytes_uploaded: u64,
    pub limits: PolicyLimits,
}

/// Registration rejected by the engine.
#[derive(Debug, Error)]
pub enum SeedRegistrationError {
    #[error("Content {0} is already registered")]
    AlreadyRegistered(ContentId),

    #[error("Save path does not hold the artifact data: {0}")]
    MissingData(PathBuf),

    #[error("Engine rejected registration: {0}")]
    Rejected(String),

    #[error("Engine is shut down")]
    EngineStopped,
}

/// Handle-level failure outside of policy application.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Handle for {0} is no longer valid")]
    InvalidHandle(ContentId),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// A single entry's policy re-application failed. Never fatal.
#[derive(Debug, Error)]
pub enum PolicyEnforcementError {
    #[error("Handle for {0} is no longer valid")]
    InvalidHandle(ContentId),

    #[error("Engine refused policy for {content_id}: {reason}")]
    Refused { content_id: ContentId, reason: String },
}

/// Per-artifact handle opened by [`DistributionEngine::register`].
#[async_trait]
pub trait EngineHandle: Send + Sync + std::fmt::Debug {
    fn content_id(&self) -> ContentId;

    /// Apply limits and optionally re-announce. Applying the same policy
    /// twice must be observably the same as applying it once.
    async fn apply_policy(&self, policy: &SeedPolicy) -> Result<(), PolicyEnforcementError>;

    async fn status(&self) -> Result<HandleStatus, EngineError>;

    /// False once the engine has torn the handle down.
    async fn is_valid(&self) -> bool;

    async fn force_announce(&self) -> Result<(), EngineError>;
}

/// Engine that serves registered artifacts to peers.
#[async_trait]
pub trait DistributionEngine: Send + Sync {
    async fn register(
        &self,
        artifact: &TorrentArtifact,
        save_path: &Path,
        flags: RegistrationFlags,
    ) -> Result<Arc<dyn EngineHandle>, SeedRegistrationError>;

    /// Release every handle and stop the engine.
    async fn shutdown(&self);
}
