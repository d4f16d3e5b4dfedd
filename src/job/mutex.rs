//! Per-key FIFO execution permits for scheduled jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::MutexKey;

/// Permits a key has unless configured otherwise: plain mutual exclusion.
pub(crate) const DEFAULT_PERMITS: usize = 1;

/// Where a waiter joins the queue of a key with no free permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuePosition {
    /// New submissions queue behind everyone.
    Tail,
    /// A job waking from a blocking wait goes first.
    Head,
}

#[derive(Debug, Default)]
struct KeyState {
    holders: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct Keys {
    active: HashMap<MutexKey, KeyState>,
    permits: HashMap<MutexKey, usize>,
}

impl Keys {
    fn permits(&self, key: &MutexKey) -> usize {
        self.permits.get(key).copied().unwrap_or(DEFAULT_PERMITS)
    }

    /// Grant free permits of `key` to waiters in queue order, skipping
    /// waiters that gave up. Forgets the key once nobody holds or wants it.
    fn grant(&mut self, key: &MutexKey) {
        let limit = self.permits(key);
        let Some(state) = self.active.get_mut(key) else {
            return;
        };
        while state.holders < limit {
            let Some(next) = state.waiters.pop_front() else {
                break;
            };
            if next.send(()).is_ok() {
                state.holders += 1;
            }
        }
        if state.holders == 0 && state.waiters.is_empty() {
            self.active.remove(key);
        }
    }
}

/// Table of execution permits per key. Each key admits a configurable number
/// of holders at once, one by default. Waiters are granted in queue order and
/// a freed permit goes straight to the next waiter, so nobody can barge in
/// between release and grant.
#[derive(Debug, Default)]
pub(crate) struct MutexTable {
    keys: Mutex<Keys>,
}

impl MutexTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Keys> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a place in line for `key`. The position is fixed when this
    /// returns, which keeps submission order even if the waiting task is
    /// polled later.
    pub(crate) fn enqueue(self: &Arc<Self>, key: MutexKey, position: QueuePosition) -> Acquire {
        let mut keys = self.lock();
        let limit = keys.permits(&key);
        let state = keys.active.entry(key.clone()).or_default();
        let receiver = if state.holders < limit && state.waiters.is_empty() {
            state.holders += 1;
            None
        } else {
            let (tx, rx) = oneshot::channel();
            match position {
                QueuePosition::Tail => state.waiters.push_back(tx),
                QueuePosition::Head => state.waiters.push_front(tx),
            }
            Some(rx)
        };
        Acquire {
            table: Arc::clone(self),
            key,
            receiver,
            granted: false,
        }
    }

    /// Give back one permit of `key` and hand it on.
    fn release(&self, key: &MutexKey) {
        let mut keys = self.lock();
        if let Some(state) = keys.active.get_mut(key) {
            state.holders = state.holders.saturating_sub(1);
        }
        keys.grant(key);
    }

    /// Change how many jobs may hold `key` at once. Raising the count grants
    /// queued waiters right away; lowering it lets current holders finish
    /// and holds back new grants until they have.
    pub(crate) fn set_permits(&self, key: MutexKey, permits: usize) {
        let mut keys = self.lock();
        if permits == DEFAULT_PERMITS {
            keys.permits.remove(&key);
        } else {
            keys.permits.insert(key.clone(), permits);
        }
        keys.grant(&key);
    }

    pub(crate) fn permits(&self, key: &MutexKey) -> usize {
        self.lock().permits(key)
    }

    #[cfg(test)]
    pub(crate) fn holders(&self, key: &MutexKey) -> usize {
        self.lock().active.get(key).map_or(0, |state| state.holders)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self, key: &MutexKey) -> usize {
        self.lock().active.get(key).map_or(0, |state| state.waiters.len())
    }
}
/// A place in line for a key. Dropping it before the grant gives up the
/// place; dropping it after an unobserved grant passes the permit on.
#[derive(Debug)]
pub(crate) struct Acquire {
    table: Arc<MutexTable>,
    key: MutexKey,
    receiver: Option<oneshot::Receiver<()>>,
    granted: bool,
}

impl Acquire {
    /// Wait for the grant.
    pub(crate) async fn wait(mut self) -> MutexPermit {
        while let Some(receiver) = self.receiver.as_mut() {
            if receiver.await.is_ok() {
                break;
            }
            // Sender vanished without a grant; take a new place at the head.
            let retry = self.table.enqueue(self.key.clone(), QueuePosition::Head);
            self.receiver = retry.disarm();
        }
        self.granted = true;
        MutexPermit {
            table: Arc::clone(&self.table),
            key: self.key.clone(),
        }
    }

    /// Take the receiver out without running the drop logic.
    fn disarm(mut self) -> Option<oneshot::Receiver<()>> {
        self.granted = true;
        self.receiver.take()
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        match self.receiver.as_mut() {
            // Immediate grant that was never awaited.
            None => self.table.release(&self.key),
            Some(receiver) => {
                receiver.close();
                if receiver.try_recv().is_ok() {
                    self.table.release(&self.key);
                }
            }
        }
    }
}

/// Holding this means holding one permit of the key. Dropping it passes the
/// permit on.
#[derive(Debug)]
pub(crate) struct MutexPermit {
    table: Arc<MutexTable>,
    key: MutexKey,
}

impl MutexPermit {
    pub(crate) fn key(&self) -> &MutexKey {
        &self.key
    }
}

impl Drop for MutexPermit {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key() -> MutexKey {
        MutexKey::named("k")
    }

    #[tokio::test]
    async fn free_key_is_granted_immediately() {
        let table = MutexTable::new();
        let permit = table.enqueue(key(), QueuePosition::Tail).wait().await;
        assert_eq!(table.holders(&key()), 1);
        drop(permit);
        assert_eq!(table.holders(&key()), 0);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_queue_order() {
        let table = MutexTable::new();
        let first = table.enqueue(key(), QueuePosition::Tail).wait().await;
        let second = table.enqueue(key(), QueuePosition::Tail);
        let third = table.enqueue(key(), QueuePosition::Tail);
        let urgent = table.enqueue(key(), QueuePosition::Head);
        assert_eq!(table.queued(&key()), 3);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (name, acquire) in [("second", second), ("third", third), ("urgent", urgent)] {
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let permit = acquire.wait().await;
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["urgent", "second", "third"]);
        assert_eq!(table.holders(&key()), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let table = MutexTable::new();
        let holder = table.enqueue(key(), QueuePosition::Tail).wait().await;
        let abandoned = table.enqueue(key(), QueuePosition::Tail);
        let next = table.enqueue(key(), QueuePosition::Tail);

        drop(abandoned);
        drop(holder);

        let permit = tokio::time::timeout(Duration::from_secs(1), next.wait())
            .await
            .expect("key should pass to the live waiter");
        assert_eq!(permit.key(), &key());
    }

    #[tokio::test]
    async fn granted_but_unobserved_waiter_passes_key_on() {
        let table = MutexTable::new();
        let holder = table.enqueue(key(), QueuePosition::Tail).wait().await;
        let granted = table.enqueue(key(), QueuePosition::Tail);
        let next = table.enqueue(key(), QueuePosition::Tail);

        drop(holder);
        drop(granted);

        tokio::time::timeout(Duration::from_secs(1), next.wait())
            .await
            .expect("key should not be lost");
    }

    #[test]
    fn unawaited_immediate_grant_frees_key() {
        let table = MutexTable::new();
        drop(table.enqueue(key(), QueuePosition::Tail));
        assert_eq!(table.holders(&key()), 0);
    }

    #[tokio::test]
    async fn three_permits_admit_three_holders() {
        let table = MutexTable::new();
        table.set_permits(key(), 3);
        let held: Vec<_> = [
            table.enqueue(key(), QueuePosition::Tail),
            table.enqueue(key(), QueuePosition::Tail),
            table.enqueue(key(), QueuePosition::Tail),
        ]
        .into_iter()
        .collect();
        let fourth = table.enqueue(key(), QueuePosition::Tail);
        assert_eq!(table.holders(&key()), 3);
        assert_eq!(table.queued(&key()), 1);

        let mut permits = Vec::new();
        for acquire in held {
            permits.push(acquire.wait().await);
        }
        drop(permits.pop());

        let _fourth = tokio::time::timeout(Duration::from_secs(1), fourth.wait())
            .await
            .expect("freed permit goes to the queued waiter");
        assert_eq!(table.holders(&key()), 3);
    }

    #[tokio::test]
    async fn zero_permits_hold_everyone_until_raised() {
        let table = MutexTable::new();
        table.set_permits(key(), 0);
        let first = table.enqueue(key(), QueuePosition::Tail);
        let second = table.enqueue(key(), QueuePosition::Tail);
        assert_eq!(table.holders(&key()), 0);
        assert_eq!(table.queued(&key()), 2);

        table.set_permits(key(), 2);
        assert_eq!(table.holders(&key()), 2);
        tokio::time::timeout(Duration::from_secs(1), async {
            first.wait().await;
            second.wait().await;
        })
        .await
        .expect("raising the permits grants the waiters");
    }

    #[tokio::test]
    async fn lowering_permits_holds_back_new_grants() {
        let table = MutexTable::new();
        table.set_permits(key(), 2);
        let a = table.enqueue(key(), QueuePosition::Tail).wait().await;
        let b = table.enqueue(key(), QueuePosition::Tail).wait().await;
        let waiting = table.enqueue(key(), QueuePosition::Tail);

        table.set_permits(key(), 1);
        drop(a);
        assert_eq!(table.holders(&key()), 1, "still over the new limit");
        assert_eq!(table.queued(&key()), 1);

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiting.wait())
            .await
            .expect("granted once under the limit");
        assert_eq!(table.permits(&key()), 1);
    }
}
