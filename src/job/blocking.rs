//! Blocking condition: cooperative wait that gives up the job's mutex.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::JobState;
use crate::context::ambient;
use crate::error::{JobError, Result};
use crate::monitor::RunMonitor;

/// A gate jobs can park on, e.g. while waiting for a user's answer.
///
/// While a job waits, its mutex key and pool capacity are released so other
/// jobs on the same key can run. On wake the job goes back to the head of
/// its key's queue. A forced cancel of the job's monitor ends the wait with
/// `JobError::Cancelled`; a soft cancel does not. An expired timeout ends it
/// with `JobError::Timeout`.
#[derive(Clone)]
pub struct BlockingCondition {
    name: Arc<str>,
    blocking: Arc<watch::Sender<bool>>,
}

impl BlockingCondition {
    pub fn new(name: &str, blocking: bool) -> Self {
        let (blocking, _) = watch::channel(blocking);
        Self {
            name: Arc::from(name),
            blocking: Arc::new(blocking),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_blocking(&self) -> bool {
        *self.blocking.borrow()
    }

    /// Block or unblock. Unblocking wakes every waiter.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.send_replace(blocking);
    }

    /// Wait until the condition stops blocking.
    ///
    /// Returns immediately if it is not blocking. `None` waits without limit.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let monitor = ambient::monitor();
        if monitor.as_ref().is_some_and(RunMonitor::is_interrupted) {
            return Err(JobError::Cancelled);
        }
        if !self.is_blocking() {
            return Ok(());
        }

        let job = ambient::job();
        let slot = job.as_ref().and_then(|job| job.slot().cloned());
        if let Some(job) = &job {
            job.transition(JobState::WaitingForBlockingCondition, Some(&self.name));
        }
        let released = slot.as_ref().is_some_and(|slot| slot.release());
        tracing::debug!(
            condition = %self.name,
            job_id = job.as_ref().map(|job| job.id()),
            released,
            "Waiting on blocking condition"
        );

        let mut rx = self.blocking.subscribe();
        let unblocked = async {
            // The sender lives in `self`, so the channel cannot close here.
            let _ = rx.wait_for(|blocking| !*blocking).await;
        };
        let interrupted = async {
            match &monitor {
                Some(monitor) => monitor.interrupted().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = interrupted => Err(JobError::Cancelled),
            result = bounded(timeout, unblocked) => result,
        };

        if let Some(slot) = &slot
            && released
        {
            slot.reacquire().await?;
        }
        if let Some(job) = &job {
            job.transition(JobState::Running, None);
        }
        if let Err(err) = &outcome {
            tracing::debug!(condition = %self.name, error = %err, "Blocking wait ended early");
        }
        outcome
    }
}

async fn bounded(timeout: Option<Duration>, wait: impl Future<Output = ()>) -> Result<()> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| JobError::Timeout(limit)),
        None => {
            wait.await;
            Ok(())
        }
    }
}

impl fmt::Debug for BlockingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingCondition")
            .field("name", &self.name)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}
