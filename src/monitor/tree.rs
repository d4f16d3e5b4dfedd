//! Arena holding the cancellation tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::{Cancellable, MonitorId, RunMonitor};

/// Cancellation signals of one node. Both tokens only ever fire once.
///
/// `cancelled` is the cancelled flag, set by soft and forced cancels alike.
/// `interrupted` fires only on a forced cancel and is what cooperative waits
/// listen to.
#[derive(Clone, Default)]
pub(crate) struct Signals {
    pub(crate) cancelled: CancellationToken,
    pub(crate) interrupted: CancellationToken,
}

impl Signals {
    /// Returns true if this call set the cancelled flag.
    fn fire(&self, interrupt: bool) -> bool {
        let first = !self.cancelled.is_cancelled();
        self.cancelled.cancel();
        if interrupt {
            self.interrupted.cancel();
        }
        first
    }
}

/// One node per live unit of work.
struct Node {
    parent: Option<MonitorId>,
    children: Vec<MonitorId>,
    signals: Signals,
    cancellables: Vec<(u64, Arc<dyn Cancellable>)>,
}

/// Cancellation tree stored as an id-indexed arena.
///
/// Nodes link to each other by id only; cascading cancel is a walk over the
/// arena under a single lock. Cancellables (user code) are always invoked
/// after the lock is released.
#[derive(Default)]
pub(crate) struct MonitorTree {
    nodes: Mutex<HashMap<MonitorId, Node>>,
    next_id: AtomicU64,
    next_cancellable: AtomicU64,
}

impl MonitorTree {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MonitorId, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node. A parent from another tree, or one that already finished,
    /// is ignored and the node becomes a root. A child of a cancelled parent
    /// starts out cancelled, and interrupted if the parent was.
    pub(crate) fn create(self: &Arc<Self>, parent: Option<&RunMonitor>) -> RunMonitor {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let signals = Signals::default();

        let mut nodes = self.lock();
        let parent_id = parent
            .filter(|p| Arc::ptr_eq(&p.tree, self))
            .map(|p| p.id)
            .filter(|pid| nodes.contains_key(pid));

        if let Some(pid) = parent_id
            && let Some(parent_node) = nodes.get_mut(&pid)
        {
            parent_node.children.push(id);
            if parent_node.signals.cancelled.is_cancelled() {
                signals.fire(parent_node.signals.interrupted.is_cancelled());
            }
        }

        nodes.insert(
            id,
            Node {
                parent: parent_id,
                children: Vec::new(),
                signals: signals.clone(),
                cancellables: Vec::new(),
            },
        );

        RunMonitor {
            id,
            signals,
            tree: Arc::clone(self),
        }
    }

    /// Drop a finished node. Live children are re-parented as roots.
    pub(crate) fn remove(&self, id: MonitorId) {
        let mut nodes = self.lock();
        let Some(node) = nodes.remove(&id) else {
            return;
        };

        if let Some(pid) = node.parent
            && let Some(parent) = nodes.get_mut(&pid)
        {
            parent.children.retain(|child| *child != id);
        }

        for child in node.children {
            if let Some(orphan) = nodes.get_mut(&child) {
                orphan.parent = None;
            }
        }
    }

    /// Cancel `id` and, depth-first, every live descendant. With `interrupt`
    /// the nodes are interrupted as well, which ends their cooperative waits.
    ///
    /// Returns true if the node moved to cancelled. A forced cancel after a
    /// soft one still interrupts the subtree but returns false.
    pub(crate) fn cancel(&self, id: MonitorId, interrupt: bool) -> bool {
        let (first, to_notify) = {
            let nodes = self.lock();
            let Some(node) = nodes.get(&id) else {
                return false;
            };
            let first = !node.signals.cancelled.is_cancelled();
            if !first && !(interrupt && !node.signals.interrupted.is_cancelled()) {
                return false;
            }

            let mut to_notify = Vec::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                let Some(node) = nodes.get(&current) else {
                    continue;
                };
                if node.signals.fire(interrupt) {
                    to_notify.extend(node.cancellables.iter().map(|(_, c)| Arc::clone(c)));
                }
                stack.extend(node.children.iter().rev().copied());
            }
            (first, to_notify)
        };

        for cancellable in to_notify {
            cancellable.cancel();
        }
        first
    }

    pub(crate) fn contains(&self, id: MonitorId) -> bool {
        self.lock().contains_key(&id)
    }

    /// True only for a live node without a parent.
    pub(crate) fn is_root(&self, id: MonitorId) -> bool {
        self.lock().get(&id).is_some_and(|node| node.parent.is_none())
    }

    pub(crate) fn parent(self: &Arc<Self>, id: MonitorId) -> Option<RunMonitor> {
        let nodes = self.lock();
        let pid = nodes.get(&id)?.parent?;
        let parent = nodes.get(&pid)?;
        Some(RunMonitor {
            id: pid,
            signals: parent.signals.clone(),
            tree: Arc::clone(self),
        })
    }

    pub(crate) fn children(self: &Arc<Self>, id: MonitorId) -> Vec<RunMonitor> {
        let nodes = self.lock();
        let Some(node) = nodes.get(&id) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|cid| {
                nodes.get(cid).map(|child| RunMonitor {
                    id: *cid,
                    signals: child.signals.clone(),
                    tree: Arc::clone(self),
                })
            })
            .collect()
    }

    pub(crate) fn roots(self: &Arc<Self>) -> Vec<RunMonitor> {
        self.lock()
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, node)| RunMonitor {
                id: *id,
                signals: node.signals.clone(),
                tree: Arc::clone(self),
            })
            .collect()
    }

    /// Attach a cancellable to a node. If the node is already cancelled the
    /// cancellable is cancelled right away. Returns `None` for a finished node.
    pub(crate) fn register_cancellable(
        &self,
        id: MonitorId,
        cancellable: Arc<dyn Cancellable>,
    ) -> Option<u64> {
        let key = self.next_cancellable.fetch_add(1, Ordering::Relaxed) + 1;
        let already_cancelled = {
            let mut nodes = self.lock();
            let node = nodes.get_mut(&id)?;
            node.cancellables.push((key, Arc::clone(&cancellable)));
            node.signals.cancelled.is_cancelled()
        };
        if already_cancelled {
            cancellable.cancel();
        }
        Some(key)
    }

    pub(crate) fn unregister_cancellable(&self, id: MonitorId, key: u64) {
        if let Some(node) = self.lock().get_mut(&id) {
            node.cancellables.retain(|(k, _)| *k != key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
