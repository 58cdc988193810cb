/// Sandbox slot pool
///
/// Fixed number of slots with an explicit, bounded wait queue. A request
/// either takes a free slot, waits for one, or is turned away with
/// `ServiceBusy` once `max_queue_depth` requests are already waiting.
use crate::config::types::{Result, SandboxError};
use crate::observability::metrics::get_metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct SandboxPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    max_queue_depth: usize,
    queued: Arc<AtomicUsize>,
}

/// One admitted request. The slot returns to the pool on drop.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        get_metrics().active_sandboxes.dec();
    }
}

/// Counts a waiter for as long as it sits in the queue, including when the
/// waiting future is dropped because the caller went away.
struct QueuedGuard {
    queued: Arc<AtomicUsize>,
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        get_metrics().queued_requests.dec();
    }
}

impl SandboxPool {
    pub fn new(capacity: usize, max_queue_depth: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_queue_depth,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot, or fail fast when the queue is full
    pub async fn admit(&self) -> Result<PoolPermit> {
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(Self::admitted(permit));
        }

        let max = self.max_queue_depth;
        self.queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                (waiting < max).then_some(waiting + 1)
            })
            .map_err(|waiting| {
                SandboxError::ServiceBusy(format!(
                    "all {} sandboxes busy and {} requests queued",
                    self.capacity, waiting
                ))
            })?;
        get_metrics().queued_requests.inc();
        let _queued = QueuedGuard {
            queued: Arc::clone(&self.queued),
        };

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::ServiceBusy("sandbox pool is shut down".to_string()))?;
        Ok(Self::admitted(permit))
    }

    fn admitted(permit: OwnedSemaphorePermit) -> PoolPermit {
        get_metrics().active_sandboxes.inc();
        PoolPermit { _permit: permit }
    }

    /// Slots currently held
    pub fn active(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Requests waiting for a slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth
    }

    /// Stop admitting; waiters get ServiceBusy
    pub fn close(&self) {
        self.slots.close();
    }
}
