//! Seeding registry.
//!
//! The one table shared by workers (insert), the reconciliation loop
//! (policy timestamps, pruning) and query handlers (read-only snapshots).
//! Engine handles never leave the registry except as short-lived snapshots.

use crate::builder::ContentId;
use crate::engine::EngineHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Content {0} is already registered")]
    Duplicate(ContentId),
}

/// A registered artifact being seeded.
#[derive(Debug, Clone)]
pub struct SeedEntry {
    pub content_id: ContentId,
    pub handle: Arc<dyn EngineHandle>,
    pub display_name: String,
    pub magnet_uri: String,
    pub size_bytes: u64,
    pub descriptor_path: PathBuf,
    pub registered_at_ms: i64,
    pub last_policy_applied_at_ms: Option<i64>,
}

impl SeedEntry {
    pub fn summary(&self) -> SeedSummary {
        SeedSummary {
            content_id: self.content_id,
            display_name: self.display_name.clone(),
            magnet_uri: self.magnet_uri.clone(),
            size_bytes: self.size_bytes,
            registered_at_ms: self.registered_at_ms,
            last_policy_applied_at_ms: self.last_policy_applied_at_ms,
        }
    }
}

/// Read-only view of an entry, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub content_id: ContentId,
    pub display_name: String,
    pub magnet_uri: String,
    pub size_bytes: u64,
    pub registered_at_ms: i64,
    pub last_policy_applied_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
pub struct SeedingRegistry {
    entries: RwLock<HashMap<ContentId, SeedEntry>>,
}

impl SeedingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: SeedEntry) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.content_id) {
            return Err(RegistryError::Duplicate(entry.content_id));
        }
        entries.insert(entry.content_id, entry);
        Ok(())
    }

    pub async fn contains(&self, id: &ContentId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn get_summary(&self, id: &ContentId) -> Option<SeedSummary> {
        self.entries.read().await.get(id).map(SeedEntry::summary)
    }

    /// Snapshot of every entry, oldest registration first.
    pub async fn list_active(&self) -> Vec<SeedSummary> {
        let mut summaries: Vec<SeedSummary> = self
            .entries
            .read()
            .await
            .values()
            .map(SeedEntry::summary)
            .collect();
        summaries.sort_by(|a, b| {
            a.registered_at_ms
                .cmp(&b.registered_at_ms)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        summaries
    }

    /// Handles to visit in one reconciliation tick. The lock is released on return.
    pub async fn handles(&self) -> Vec<(ContentId, Arc<dyn EngineHandle>)> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| (e.content_id, e.handle.clone()))
            .collect()
    }

    /// Returns false if the entry is gone.
    pub async fn mark_policy_applied(&self, id: &ContentId, at_ms: i64) -> bool {
        match self.entries.write().await.get_mut(id) {
            Some(entry) => {
                entry.last_policy_applied_at_ms = Some(at_ms);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &ContentId) -> Option<SeedSummary> {
        self.entries.write().await.remove(id).map(|e| e.summary())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
