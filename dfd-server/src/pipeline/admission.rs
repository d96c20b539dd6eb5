//! Admission control for classifier processes
//!
//! A fixed number of permits bounds how many classifier processes run at
//! once. When all are taken, a bounded number of requests may wait a bounded
//! time for one; everything beyond that is rejected straight away, so queued
//! uploads cannot pile up in memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// No permit became available
#[derive(Debug, Error)]
pub enum AdmissionRejected {
    #[error("all {capacity} classifier slots busy for {}ms", waited.as_millis())]
    WaitElapsed { capacity: usize, waited: Duration },

    #[error("all {capacity} classifier slots busy and {waiting} requests already waiting")]
    QueueFull { capacity: usize, waiting: usize },
}

/// Semaphore-backed classifier slots
#[derive(Debug, Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
    max_waiting: usize,
    waiting: Arc<AtomicUsize>,
}

/// Counts one waiting request for as long as it lives
struct WaitingSlot(Arc<AtomicUsize>);

impl Drop for WaitingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(capacity: usize, wait: Duration, max_waiting: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
            max_waiting,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a slot. The slot is returned when the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AdmissionRejected> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            debug!(in_use = self.in_use(), capacity = self.capacity, "Classifier slot acquired");
            return Ok(permit);
        }

        let already_waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = WaitingSlot(Arc::clone(&self.waiting));
        if self.wait.is_zero() || already_waiting >= self.max_waiting {
            warn!(
                capacity = self.capacity,
                waiting = already_waiting,
                "Rejecting upload: classifier slots exhausted"
            );
            return Err(AdmissionRejected::QueueFull {
                capacity: self.capacity,
                waiting: already_waiting,
            });
        }

        match tokio::time::timeout(self.wait, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(in_use = self.in_use(), capacity = self.capacity, "Classifier slot acquired after wait");
                Ok(permit)
            }
            // Closed semaphore or elapsed wait
            _ => {
                warn!(
                    capacity = self.capacity,
                    waited_ms = self.wait.as_millis() as u64,
                    "Rejecting upload: no classifier slot freed in time"
                );
                Err(AdmissionRejected::WaitElapsed {
                    capacity: self.capacity,
                    waited: self.wait,
                })
            }
        }
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Requests currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
