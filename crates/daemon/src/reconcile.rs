//! Reconciliation loop.
//!
//! Every tick re-asserts the seeding policy on each actively seeding entry,
//! prunes entries whose engine handle has been torn down and fills free
//! worker slots from the queue. One entry's failure never aborts a tick, and
//! a failed tick never stops the loop.

use crate::builder::ContentId;
use crate::engine::{EngineError, EngineHandle, PolicyEnforcementError, SeedPolicy};
use crate::job::current_timestamp_ms;
use crate::metrics::SharedMetrics;
use crate::pipeline::{signalled, WorkerPool};
use crate::registry::SeedingRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Entries whose policy was re-applied
    pub reapplied: usize,
    /// Entries not currently seeding
    pub skipped: usize,
    /// Entries removed because their handle is gone
    pub pruned: usize,
    pub policy_failures: usize,
    /// Jobs moved from the queue into worker slots
    pub admitted: usize,
}

/// What happened to one registry entry during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryResult {
    Reapplied,
    Skipped,
    Gone,
    Failed,
}

/// Engine calls for one entry. Runs in its own task.
async fn reconcile_entry(
    id: ContentId,
    handle: Arc<dyn EngineHandle>,
    policy: SeedPolicy,
) -> EntryResult {
    if !handle.is_valid().await {
        return EntryResult::Gone;
    }

    match handle.status().await {
        Ok(status) if status.state.is_seeding() => match handle.apply_policy(&policy).await {
            Ok(()) => EntryResult::Reapplied,
            Err(PolicyEnforcementError::InvalidHandle(_)) => EntryResult::Gone,
            Err(e) => {
                warn!(content_id = %id, error = %e, "Policy re-application failed");
                EntryResult::Failed
            }
        },
        Ok(status) => {
            debug!(content_id = %id, state = %status.state, "Not seeding, policy left alone");
            EntryResult::Skipped
        }
        Err(EngineError::InvalidHandle(_)) => EntryResult::Gone,
        Err(e) => {
            warn!(content_id = %id, error = %e, "Could not read handle status");
            EntryResult::Failed
        }
    }
}

pub struct Reconciler {
    pool: Arc<WorkerPool>,
    registry: Arc<SeedingRegistry>,
    metrics: SharedMetrics,
    policy: SeedPolicy,
    interval: Duration,
    backoff: Duration,
    /// Budget for one entry's engine calls
    entry_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        pool: Arc<WorkerPool>,
        metrics: SharedMetrics,
        policy: SeedPolicy,
        interval: Duration,
        backoff: Duration,
        entry_timeout: Duration,
    ) -> Self {
        let registry = pool.registry().clone();
        Self {
            pool,
            registry,
            metrics,
            policy,
            interval,
            backoff,
            entry_timeout,
        }
    }

    /// One pass over the registry followed by admission.
    ///
    /// Every entry runs in its own task under `entry_timeout`; a hung or
    /// panicking handle counts as a policy failure and the pass moves on.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let tasks: Vec<_> = self
            .registry
            .handles()
            .await
            .into_iter()
            .map(|(id, handle)| {
                let work = tokio::time::timeout(
                    self.entry_timeout,
                    reconcile_entry(id, handle, self.policy),
                );
                (id, tokio::spawn(work))
            })
            .collect();

        for (id, task) in tasks {
            let result = match task.await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    warn!(content_id = %id, timeout_secs = self.entry_timeout.as_secs_f64(), "Engine did not answer in time");
                    EntryResult::Failed
                }
                Err(e) => {
                    warn!(content_id = %id, error = %e, "Reconciling entry panicked");
                    EntryResult::Failed
                }
            };

            match result {
                EntryResult::Reapplied => {
                    self.registry
                        .mark_policy_applied(&id, current_timestamp_ms())
                        .await;
                    report.reapplied += 1;
                }
                EntryResult::Skipped => report.skipped += 1,
                EntryResult::Gone => self.prune(&id, &mut report).await,
                EntryResult::Failed => report.policy_failures += 1,
            }
        }

        report.admitted = self.pool.admit();

        let seeding = self.registry.len().await;
        {
            let mut metrics = self.metrics.write().await;
            metrics.seeding = seeding;
            metrics.last_tick_unix_ms = Some(current_timestamp_ms());
        }

        report
    }

    async fn prune(&self, id: &ContentId, report: &mut TickReport) {
        if let Some(removed) = self.registry.remove(id).await {
            info!(content_id = %id, name = %removed.display_name, "Handle gone, removed from registry");
            report.pruned += 1;
        }
    }

    /// Tick until `shutdown` turns true.
    ///
    /// Each tick runs in its own task so a panic is caught like any other
    /// failure and followed by the back-off delay.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            backoff_secs = self.backoff.as_secs_f64(),
            "Reconciliation loop started"
        );

        loop {
            let this = self.clone();
            let delay = match tokio::spawn(async move { this.tick().await }).await {
                Ok(report) => {
                    debug!(
                        reapplied = report.reapplied,
                        skipped = report.skipped,
                        pruned = report.pruned,
                        policy_failures = report.policy_failures,
                        admitted = report.admitted,
                        "Reconciliation tick"
                    );
                    self.interval
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = self.backoff.as_secs_f64(), "Reconciliation tick failed");
                    self.backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signalled(&mut shutdown) => break,
            }
        }

        info!("Reconciliation loop stopped");
    }
}
