//! Bounded FIFO job queue with slot-based admission.
//!
//! Waiting jobs sit in a `VecDeque` behind a mutex; worker slots are permits
//! of a semaphore sized to K. [`JobQueue::admit`] pairs the queue head with a
//! free permit under the queue lock, so concurrent triggers can never admit the
//! same job twice or admit past K.

use crate::job::IngestionJob;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Reasons an offer is refused at submit time.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Queue is full ({capacity} jobs waiting)")]
    QueueOverflow { capacity: usize },

    #[error("File is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

/// Jobs holding a slot and jobs waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub admitted: usize,
    pub waiting: usize,
}

/// A job paired with the worker slot it now owns.
#[derive(Debug)]
pub struct Admission {
    pub job: IngestionJob,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct JobQueue {
    waiting: Mutex<VecDeque<IngestionJob>>,
    capacity: usize,
    slots: Arc<Semaphore>,
    max_admitted: usize,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(max_admitted: usize, capacity: usize) -> Self {
        let max_admitted = max_admitted.max(1);
        Self {
            waiting: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            slots: Arc::new(Semaphore::new(max_admitted)),
            max_admitted,
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<IngestionJob>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail. Fails without side effects when full or closed.
    pub fn push(&self, job: IngestionJob) -> Result<(), SubmitError> {
        let mut waiting = self.lock();
        // checked under the lock so a concurrent drain cannot miss this job
        if self.is_closed() {
            return Err(SubmitError::ShuttingDown);
        }
        if waiting.len() >= self.capacity {
            return Err(SubmitError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        waiting.push_back(job);
        Ok(())
    }

    /// Dequeue one job per free slot, head first.
    ///
    /// Safe to call from any number of triggers at once.
    pub fn admit(&self) -> Vec<Admission> {
        let mut waiting = self.lock();
        let mut admitted = Vec::new();

        while !waiting.is_empty() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            match waiting.pop_front() {
                Some(job) => admitted.push(Admission { job, permit }),
                None => break,
            }
        }
        admitted
    }

    pub fn depth(&self) -> QueueDepth {
        let waiting = self.lock().len();
        QueueDepth {
            admitted: self.admitted(),
            waiting,
        }
    }

    pub fn admitted(&self) -> usize {
        self.max_admitted - self.slots.available_permits()
    }

    pub fn max_admitted(&self) -> usize {
        self.max_admitted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting new jobs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove every waiting job, in submission order.
    pub fn drain_waiting(&self) -> Vec<IngestionJob> {
        self.lock().drain(..).collect()
    }

    /// Resolve once every slot has been released.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.slots.acquire_many(self.max_admitted as u32).await {
            drop(all);
        }
    }
}
