//! Run monitors: cancellation tree of running and queued work.
//!
//! Core components:
//! - `tree`: Arena of monitor nodes with cascading cancel
//! - `registry`: Lookup from (job id, session) and (session, request id) to live monitors

pub mod registry;
pub(crate) mod tree;

use std::fmt;
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::context::ambient;

pub use registry::{CancellationRegistry, RegistryHandle};
pub(crate) use tree::MonitorTree;
use tree::Signals;

/// Identifier of a monitor node, unique within its scheduler.
pub type MonitorId = u64;

/// Something that can be told to stop: open transactions, external calls.
pub trait Cancellable: Send + Sync {
    /// Returns true if this call moved the resource into the cancelled state.
    fn cancel(&self) -> bool;

    fn is_cancelled(&self) -> bool;
}

/// Handle to one node of the cancellation tree.
///
/// Cancelling a monitor cascades to every live descendant. Cancellation is
/// advisory: code observes it through `is_cancelled` or `cancelled().await`.
/// A forced cancel also interrupts the monitor, which ends cooperative waits
/// such as `BlockingCondition::wait`; a soft cancel leaves them parked.
#[derive(Clone)]
pub struct RunMonitor {
    pub(crate) id: MonitorId,
    pub(crate) signals: Signals,
    pub(crate) tree: Arc<MonitorTree>,
}

impl RunMonitor {
    /// Monitor of the job currently executing.
    pub fn current() -> Option<Self> {
        ambient::monitor()
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.cancelled.is_cancelled()
    }

    /// True once a forced cancel reached this monitor.
    pub fn is_interrupted(&self) -> bool {
        self.signals.interrupted.is_cancelled()
    }

    /// Cancel and interrupt this monitor and its descendants. Returns false
    /// if it was already cancelled or its job has finished.
    pub fn cancel(&self) -> bool {
        self.tree.cancel(self.id, true)
    }

    /// Mark this monitor and its descendants cancelled and notify their
    /// cancellables, without interrupting waits in progress.
    pub fn cancel_soft(&self) -> bool {
        self.tree.cancel(self.id, false)
    }

    /// Resolves once this monitor is cancelled, softly or forcibly.
    pub async fn cancelled(&self) {
        self.signals.cancelled.cancelled().await
    }

    /// Resolves once this monitor is interrupted by a forced cancel.
    pub async fn interrupted(&self) {
        self.signals.interrupted.cancelled().await
    }

    /// A token that fires together with this monitor, for use in `select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.signals.cancelled.child_token()
    }

    /// True while the job is live and has no parent monitor.
    pub fn is_root(&self) -> bool {
        self.tree.is_root(self.id)
    }

    /// False once the job that owns this monitor has finished.
    pub fn is_live(&self) -> bool {
        self.tree.contains(self.id)
    }

    pub fn parent(&self) -> Option<RunMonitor> {
        self.tree.parent(self.id)
    }

    pub fn children(&self) -> Vec<RunMonitor> {
        self.tree.children(self.id)
    }

    /// Notify `cancellable` when this monitor is cancelled, until the returned
    /// registration is dropped.
    pub fn register_cancellable(&self, cancellable: Arc<dyn Cancellable>) -> CancellableRegistration {
        let key = self.tree.register_cancellable(self.id, cancellable);
        CancellableRegistration {
            tree: Arc::downgrade(&self.tree),
            monitor: self.id,
            key,
        }
    }
}

impl PartialEq for RunMonitor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.tree, &other.tree)
    }
}

impl Eq for RunMonitor {}

impl fmt::Debug for RunMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunMonitor")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Keeps a cancellable attached to a monitor; detaches it on drop.
#[must_use = "the cancellable is detached as soon as the registration is dropped"]
pub struct CancellableRegistration {
    tree: Weak<MonitorTree>,
    monitor: MonitorId,
    key: Option<u64>,
}

impl Drop for CancellableRegistration {
    fn drop(&mut self) {
        if let (Some(key), Some(tree)) = (self.key, self.tree.upgrade()) {
            tree.unregister_cancellable(self.monitor, key);
        }
    }
}
