//! Handle to a scheduled job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{JobInfo, JobState};
use crate::error::{panic_message, JobError, Result};
use crate::monitor::RunMonitor;

/// Eventual completion of a scheduled job: its result, its error, or its
/// cancellation.
pub struct JobHandle<T> {
    job: Arc<JobInfo>,
    monitor: RunMonitor,
    task: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(job: Arc<JobInfo>, monitor: RunMonitor, task: JoinHandle<Result<T>>) -> Self {
        Self { job, monitor, task }
    }

    /// Cancel the job and everything nested in it. A job still waiting for
    /// its mutex never runs its body.
    pub fn cancel(&self) -> bool {
        self.monitor.cancel()
    }

    /// Mark the job cancelled without interrupting it. A queued job still
    /// never runs; a running one keeps going until it checks
    /// `RunMonitor::is_cancelled`.
    pub fn cancel_soft(&self) -> bool {
        self.monitor.cancel_soft()
    }

    pub fn job(&self) -> &Arc<JobInfo> {
        &self.job
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.monitor
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.monitor.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait up to `timeout` for the job to reach `Done` without consuming
    /// the handle.
    pub async fn await_done(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.job.subscribe();
        let done = async {
            // A dropped sender means the job info is gone, so it is done too.
            let _ = rx.wait_for(JobState::is_terminal).await;
        };
        tokio::time::timeout(timeout, done)
            .await
            .map_err(|_| JobError::Timeout(timeout))
    }

    /// Wait for the job's result.
    pub async fn join(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(JobError::Panicked(panic_message(err.into_panic().as_ref())))
            }
            Err(_) => Err(JobError::Cancelled),
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job", &self.job)
            .field("monitor", &self.monitor)
            .finish()
    }
}
