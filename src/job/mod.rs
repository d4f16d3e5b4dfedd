//! Jobs: submission, serialization and execution of units of work.
//!
//! Core components:
//! - `scheduler`: `JobScheduler` with inline `run_now` and queued `schedule`
//! - `descriptor`: `JobDescriptor` and `MutexKey`
//! - `state`: Job lifecycle state machine
//! - `mutex`: Per-key FIFO mutex table
//! - `slot`: Mutex key plus pool capacity held by a running job
//! - `blocking`: Cooperative wait that releases the job's slot
//! - `handle`: `JobHandle` for scheduled jobs

pub mod blocking;
pub mod descriptor;
pub mod handle;
pub(crate) mod mutex;
pub mod scheduler;
pub(crate) mod slot;
pub mod state;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::context::ambient;
use crate::error::Result;

pub use blocking::BlockingCondition;
pub use descriptor::{JobDescriptor, MutexKey};
pub use handle::JobHandle;
pub use scheduler::{JobScheduler, JobSchedulerBuilder};
pub use state::{JobLifecycle, JobOutcome, JobState, StateTransition};

use slot::ExecutionSlot;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Live information about one submitted job.
pub struct JobInfo {
    id: u64,
    name: String,
    session_id: Option<String>,
    correlation_id: Option<String>,
    seq: u64,
    lifecycle: Mutex<JobLifecycle>,
    state: watch::Sender<JobState>,
    slot: Option<Arc<ExecutionSlot>>,
}

impl JobInfo {
    pub(crate) fn new(descriptor: &JobDescriptor, slot: Option<Arc<ExecutionSlot>>) -> Self {
        let context = descriptor.context();
        let (state, _) = watch::channel(JobState::Scheduled);
        Self {
            id: descriptor.id(),
            name: descriptor.name().to_string(),
            session_id: context.session_id().map(str::to_string),
            correlation_id: context.correlation_id().map(str::to_string),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            lifecycle: Mutex::new(JobLifecycle::new()),
            state,
            slot,
        }
    }

    /// The job currently executing, if any.
    pub fn current() -> Option<Arc<JobInfo>> {
        ambient::job()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Submission order across all schedulers in the process.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Snapshot of state, timestamps and history.
    pub fn lifecycle(&self) -> JobLifecycle {
        self.lock().clone()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.lock().outcome.clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, JobLifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, to: JobState, reason: Option<&str>) {
        let result = self.lock().transition_to(to, reason.map(str::to_string));
        match result {
            Ok(()) => {
                self.state.send_replace(to);
                tracing::trace!(job_id = self.id, job_name = %self.name, state = %to, "Job state changed");
            }
            Err(message) => {
                tracing::warn!(job_id = self.id, job_name = %self.name, "{message}");
            }
        }
    }

    pub(crate) fn record_outcome(&self, outcome: JobOutcome) {
        self.lock().outcome.get_or_insert(outcome);
    }

    /// Record the final result (unless the chain already did) and move to `Done`.
    pub(crate) fn finish<T>(&self, result: &Result<T>) {
        self.record_outcome(JobOutcome::from_result(result));
        self.transition(JobState::Done, None);
    }

    pub(crate) fn slot(&self) -> Option<&Arc<ExecutionSlot>> {
        self.slot.as_ref()
    }
}

impl fmt::Debug for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
