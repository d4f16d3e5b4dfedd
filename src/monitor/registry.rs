//! Cancellation registry: finds live monitors for externally triggered cancels.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::{MonitorId, MonitorTree, RunMonitor};
use crate::job::JobInfo;

type EntryId = u64;

/// A registered monitor and the keys it can be found under.
///
/// Job entries follow the root rule: only a monitor without a parent is
/// cancelled directly, nested ones go down with their root. Request entries
/// were registered explicitly and are cancelled directly.
struct Entry {
    monitor: MonitorId,
    job: Option<Arc<JobInfo>>,
    job_key: Option<(u64, Option<String>)>,
    session_id: Option<String>,
    request_key: Option<(String, String)>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<EntryId, Entry>,
    by_job: HashMap<(u64, Option<String>), HashSet<EntryId>>,
    by_session: HashMap<String, HashSet<EntryId>>,
    by_request: HashMap<(String, String), HashSet<EntryId>>,
}

impl RegistryState {
    fn insert(&mut self, id: EntryId, entry: Entry) {
        if let Some(key) = &entry.job_key {
            self.by_job.entry(key.clone()).or_default().insert(id);
        }
        if let Some(session_id) = &entry.session_id {
            self.by_session.entry(session_id.clone()).or_default().insert(id);
        }
        if let Some(key) = &entry.request_key {
            self.by_request.entry(key.clone()).or_default().insert(id);
        }
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(key) = entry.job_key {
            remove_from_index(&mut self.by_job, key, id);
        }
        if let Some(session_id) = entry.session_id {
            remove_from_index(&mut self.by_session, session_id, id);
        }
        if let Some(key) = entry.request_key {
            remove_from_index(&mut self.by_request, key, id);
        }
    }
}

fn remove_from_index<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, HashSet<EntryId>>,
    key: K,
    id: EntryId,
) {
    if let Some(ids) = index.get_mut(&key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}

struct RegistryInner {
    tree: Arc<MonitorTree>,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lookup table from job and request keys to live run monitors.
///
/// Every registration returns a `RegistryHandle`; dropping it removes the
/// entry, so unregistering happens on every exit path of the owning job.
/// Entries whose monitor has already left the tree are treated as stale:
/// lookups skip and prune them.
#[derive(Clone)]
pub struct CancellationRegistry {
    inner: Arc<RegistryInner>,
}

impl CancellationRegistry {
    pub(crate) fn new(tree: Arc<MonitorTree>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tree,
                state: Mutex::new(RegistryState::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn insert(&self, entry: Entry) -> RegistryHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.lock().insert(id, entry);
        RegistryHandle {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Register a job's monitor under (job id, session). Id 0 keeps the job
    /// out of cancel-by-id lookups; it stays reachable through its session.
    pub(crate) fn register_job(&self, job: &Arc<JobInfo>, monitor: &RunMonitor) -> RegistryHandle {
        let session_id = job.session_id().map(str::to_string);
        let job_key = (job.id() != 0).then(|| (job.id(), session_id.clone()));
        self.insert(Entry {
            monitor: monitor.id(),
            job: Some(Arc::clone(job)),
            job_key,
            session_id,
            request_key: None,
        })
    }

    /// Associate long-running work with an inbound request so a later abort
    /// message for (session, request) can find and cancel it.
    pub fn register(&self, monitor: &RunMonitor, session_id: &str, request_id: &str) -> RegistryHandle {
        self.insert(Entry {
            monitor: monitor.id(),
            job: None,
            job_key: None,
            session_id: Some(session_id.to_string()),
            request_key: Some((session_id.to_string(), request_id.to_string())),
        })
    }

    pub fn unregister(&self, handle: RegistryHandle) {
        drop(handle);
    }

    /// Cancel every root job registered under (job id, session).
    ///
    /// Returns true if at least one matching root moved to cancelled. Matches
    /// that are nested inside another job are left to their root's cascade.
    pub fn cancel(&self, job_id: u64, session_id: Option<&str>) -> bool {
        if job_id == 0 {
            return false;
        }
        let key = (job_id, session_id.map(str::to_string));
        let targets = {
            let state = self.inner.lock();
            collect_targets(&state, state.by_job.get(&key))
        };
        let cancelled = self.cancel_targets(targets);
        tracing::debug!(job_id, session_id, cancelled, "Cancel by job id");
        cancelled
    }

    /// Cancel everything registered for a session: root jobs and request
    /// registrations alike.
    pub fn cancel_all_by_session(&self, session_id: &str) -> bool {
        let targets = {
            let state = self.inner.lock();
            collect_targets(&state, state.by_session.get(session_id))
        };
        let cancelled = self.cancel_targets(targets);
        tracing::debug!(session_id, cancelled, "Cancel all by session");
        cancelled
    }

    pub fn cancel_all_by_session_and_request_id(&self, session_id: &str, request_id: &str) -> bool {
        let key = (session_id.to_string(), request_id.to_string());
        let targets = {
            let state = self.inner.lock();
            collect_targets(&state, state.by_request.get(&key))
        };
        let cancelled = self.cancel_targets(targets);
        tracing::debug!(session_id, request_id, cancelled, "Cancel by request id");
        cancelled
    }

    /// Monitor ids mapped to (entry ids, whether the root rule applies).
    fn cancel_targets(&self, targets: BTreeMap<MonitorId, (Vec<EntryId>, bool)>) -> bool {
        let tree = &self.inner.tree;
        let mut stale = Vec::new();
        let mut any = false;

        for (monitor, (entries, root_only)) in targets {
            if !tree.contains(monitor) {
                stale.extend(entries);
                continue;
            }
            if root_only && !tree.is_root(monitor) {
                continue;
            }
            any |= tree.cancel(monitor, true);
        }

        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "Pruning stale registry entries");
            let mut state = self.inner.lock();
            for id in stale {
                state.remove(id);
            }
        }
        any
    }

    /// Jobs currently registered (running or queued).
    pub fn jobs(&self) -> Vec<Arc<JobInfo>> {
        let state = self.inner.lock();
        let mut jobs: Vec<_> = state
            .entries
            .values()
            .filter(|entry| self.inner.tree.contains(entry.monitor))
            .filter_map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.seq());
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn collect_targets(
    state: &RegistryState,
    ids: Option<&HashSet<EntryId>>,
) -> BTreeMap<MonitorId, (Vec<EntryId>, bool)> {
    let mut targets: BTreeMap<MonitorId, (Vec<EntryId>, bool)> = BTreeMap::new();
    for id in ids.into_iter().flatten() {
        if let Some(entry) = state.entries.get(id) {
            let target = targets.entry(entry.monitor).or_insert((Vec::new(), true));
            target.0.push(*id);
            // an explicit request registration overrides the root rule
            target.1 &= entry.job.is_some();
        }
    }
    targets
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Removes its registry entry when dropped.
#[must_use = "the entry is unregistered as soon as the handle is dropped"]
pub struct RegistryHandle {
    registry: Weak<RegistryInner>,
    id: EntryId,
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandle").field("id", &self.id).finish()
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().remove(self.id);
        }
    }
}
