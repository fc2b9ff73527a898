//! Per-action concurrency bound with a FIFO overflow queue.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BulkheadConfig;
use crate::error::BrokerError;

/// Bounds concurrent executions of one local action.
///
/// Admission is a fair semaphore: excess calls wait in arrival order up to
/// `max_queue` waiters, anything beyond that is rejected with `QueueFull`.
/// The returned permit is held for the duration of the handler.
pub(crate) struct Bulkhead {
    cfg: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Cell<u32>,
}

impl Bulkhead {
    pub(crate) fn new(cfg: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.concurrency as usize));
        Self {
            cfg,
            semaphore,
            queued: Cell::new(0),
        }
    }

    #[cfg(test)]
    fn queued(&self) -> u32 {
        self.queued.get()
    }

    /// Executions currently holding a slot.
    pub(crate) fn in_flight(&self) -> u32 {
        self.cfg.concurrency - self.semaphore.available_permits() as u32
    }

    /// Acquire an execution slot, queueing if the action is saturated.
    ///
    /// Returns `Ok(None)` when the bulkhead is disabled.
    pub(crate) async fn acquire(
        self: &Rc<Self>,
        action: &str,
    ) -> Result<Option<OwnedSemaphorePermit>, BrokerError> {
        if !self.cfg.enabled {
            return Ok(None);
        }
        let semaphore = Arc::clone(&self.semaphore);
        let queue_slot = if semaphore.available_permits() == 0 {
            if self.queued.get() >= self.cfg.max_queue {
                return Err(BrokerError::QueueFull {
                    action: action.to_string(),
                });
            }
            Some(QueueSlot::enter(self))
        } else {
            None
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::QueueFull {
                action: action.to_string(),
            })?;
        drop(queue_slot);
        Ok(Some(permit))
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued.get())
            .finish()
    }
}

/// Keeps the queued count honest even when a waiter is cancelled mid-wait.
struct QueueSlot {
    bulkhead: Rc<Bulkhead>,
}

impl QueueSlot {
    fn enter(bulkhead: &Rc<Bulkhead>) -> Self {
        bulkhead.queued.set(bulkhead.queued.get() + 1);
        Self {
            bulkhead: Rc::clone(bulkhead),
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.bulkhead.queued.set(self.bulkhead.queued.get() - 1);
    }
}
