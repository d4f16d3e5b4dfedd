//! Execution slot: the mutex key and pool permit a scheduled job runs under.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::mutex::{Acquire, MutexPermit, MutexTable, QueuePosition};
use super::MutexKey;
use crate::error::{JobError, Result};

#[derive(Debug, Default)]
struct Held {
    mutex: Option<MutexPermit>,
    pool: Option<OwnedSemaphorePermit>,
}

/// What a scheduled job must hold while its body runs: its mutex key (if it
/// has one) and one unit of pool capacity.
///
/// Inline jobs share the slot of the scheduled job they run in, so a blocking
/// wait anywhere down the call stack releases the same slot.
#[derive(Debug)]
pub(crate) struct ExecutionSlot {
    mutex: Option<(Arc<MutexTable>, MutexKey)>,
    pool: Arc<Semaphore>,
    held: Mutex<Held>,
}

impl ExecutionSlot {
    pub(crate) fn new(mutexes: &Arc<MutexTable>, key: Option<MutexKey>, pool: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            mutex: key.map(|key| (Arc::clone(mutexes), key)),
            pool,
            held: Mutex::new(Held::default()),
        })
    }

    fn held(&self) -> MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn key(&self) -> Option<&MutexKey> {
        self.mutex.as_ref().map(|(_, key)| key)
    }

    /// Queue for the mutex key at `position`. `None` when unserialized.
    pub(crate) fn enqueue(&self, position: QueuePosition) -> Option<Acquire> {
        self.mutex
            .as_ref()
            .map(|(table, key)| table.enqueue(key.clone(), position))
    }

    /// Wait for the mutex grant (if queued), then for pool capacity.
    pub(crate) async fn acquire(&self, place: Option<Acquire>) -> Result<()> {
        if let Some(place) = place {
            let permit = place.wait().await;
            tracing::trace!(key = %permit.key(), "Mutex acquired");
            self.held().mutex = Some(permit);
        }
        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| JobError::Cancelled)?;
        self.held().pool = Some(permit);
        Ok(())
    }

    /// Wake-up path of a blocking wait: back in at the head of the queue.
    pub(crate) async fn reacquire(&self) -> Result<()> {
        let place = self.enqueue(QueuePosition::Head);
        self.acquire(place).await
    }

    /// Give up the mutex and pool capacity. Returns true if anything was held.
    pub(crate) fn release(&self) -> bool {
        let (mutex, pool) = {
            let mut held = self.held();
            (held.mutex.take(), held.pool.take())
        };
        mutex.is_some() || pool.is_some()
    }

    #[cfg(test)]
    pub(crate) fn holds_mutex(&self) -> bool {
        self.held().mutex.is_some()
    }
}
