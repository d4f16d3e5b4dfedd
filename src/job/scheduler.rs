//! Job scheduler: inline and queued execution of units of work.
//!
//! The scheduler provides:
//! - `run_now()`: run the full chain inline in the calling task
//! - `schedule()`: queue behind the job's mutex key and run on a spawned task
//! - Cancellation by job id, session, or (session, request id)
//! - Shutdown that rejects new work and cancels every root job

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use super::mutex::{MutexTable, QueuePosition};
use super::slot::ExecutionSlot;
use super::{JobDescriptor, JobHandle, JobInfo, JobState, MutexKey};
use crate::chain::decorators::{self, ChainSetup};
use crate::chain::{ChainExtension, PropagationChain};
use crate::config::SchedulerConfig;
use crate::context::ambient;
use crate::error::{JobError, Result};
use crate::monitor::{CancellationRegistry, MonitorId, MonitorTree, RegistryHandle, RunMonitor};
use crate::transaction::{
    BasicTransactionFactory, TransactionBoundary, TransactionFactory,
};

struct Inner {
    config: SchedulerConfig,
    tree: Arc<MonitorTree>,
    registry: CancellationRegistry,
    mutexes: Arc<MutexTable>,
    pool: Arc<Semaphore>,
    transactions: Arc<dyn TransactionFactory>,
    extensions: Vec<Arc<dyn ChainExtension>>,
    shut_down: AtomicBool,
    tracker: TaskTracker,
}

/// Runs units of work with propagated context, transaction boundaries and
/// cancellation support.
///
/// Cheap to clone; clones share the same monitor tree, registry and queues.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

/// Builder for `JobScheduler`.
pub struct JobSchedulerBuilder {
    config: SchedulerConfig,
    transactions: Arc<dyn TransactionFactory>,
    extensions: Vec<Arc<dyn ChainExtension>>,
    permits: Vec<(MutexKey, usize)>,
}

impl JobSchedulerBuilder {
    /// Factory for transactions started by boundaries whose context does not
    /// bring its own. Defaults to `BasicTransactionFactory`.
    pub fn transaction_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transactions = factory;
        self
    }

    /// Extension spliced into every job's chain.
    pub fn extension(mut self, extension: Arc<dyn ChainExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Let up to `permits` jobs on `key` run at once instead of one.
    pub fn permits(mut self, key: MutexKey, permits: usize) -> Self {
        self.permits.push((key, permits));
        self
    }

    pub fn build(self) -> JobScheduler {
        let tree = MonitorTree::new();
        let mutexes = MutexTable::new();
        for (key, permits) in self.permits {
            mutexes.set_permits(key, permits);
        }
        JobScheduler {
            inner: Arc::new(Inner {
                registry: CancellationRegistry::new(Arc::clone(&tree)),
                tree,
                mutexes,
                pool: Arc::new(Semaphore::new(self.config.max_concurrent_jobs)),
                config: self.config,
                transactions: self.transactions,
                extensions: self.extensions,
                shut_down: AtomicBool::new(false),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

/// Keeps a job's monitor node and registry entry alive; removes both on drop,
/// whichever way the job ends.
struct Registration {
    tree: Arc<MonitorTree>,
    monitor: MonitorId,
    _entry: RegistryHandle,
}

impl Registration {
    fn new(inner: &Inner, job: &Arc<JobInfo>, monitor: &RunMonitor) -> Self {
        Self {
            tree: Arc::clone(&inner.tree),
            monitor: monitor.id(),
            _entry: inner.registry.register_job(job, monitor),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tree.remove(self.monitor);
    }
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SchedulerConfig) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            config,
            transactions: Arc::new(BasicTransactionFactory),
            extensions: Vec::new(),
            permits: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.inner.registry
    }

    /// Run `unit` inline in the calling task.
    ///
    /// The job's monitor is a child of the caller's monitor (or of the
    /// descriptor's explicit parent), so cancelling the caller cascades into
    /// it. No mutex is taken: the job runs within whatever slot its caller
    /// holds.
    pub async fn run_now<T, F>(&self, descriptor: JobDescriptor, unit: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.check_open()?;
        validate(&descriptor)?;

        let parent = descriptor
            .parent_monitor()
            .cloned()
            .or_else(ambient::monitor);
        let monitor = self.inner.tree.create(parent.as_ref());
        let slot = ambient::job().and_then(|caller| caller.slot().cloned());
        let job = Arc::new(JobInfo::new(&descriptor, slot));
        let registration = Registration::new(&self.inner, &job, &monitor);

        tracing::debug!(
            job_id = job.id(),
            job_name = %job.name(),
            monitor_id = monitor.id(),
            parent_id = parent.as_ref().map(RunMonitor::id),
            "Running job inline"
        );

        let result = self
            .inner
            .execute(Arc::clone(&job), monitor, descriptor, unit)
            .await;

        drop(registration);
        job.finish(&result);
        result
    }

    /// Queue `unit` for execution on its own task.
    ///
    /// Jobs with the same mutex key are admitted in submission order, as many
    /// at a time as the key has permits (one by default); others run
    /// concurrently up to `max_concurrent_jobs`. The job's monitor
    /// is a new root unless the descriptor names a parent.
    pub fn schedule<T, F>(&self, descriptor: JobDescriptor, unit: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.check_open()?;
        validate(&descriptor)?;

        let descriptor = with_correlation_id(descriptor);
        let monitor = self.inner.tree.create(descriptor.parent_monitor());
        let slot = ExecutionSlot::new(
            &self.inner.mutexes,
            descriptor.mutex_key(),
            Arc::clone(&self.inner.pool),
        );
        // Take the place in line now so submission order is queue order.
        let place = slot.enqueue(QueuePosition::Tail);
        let job = Arc::new(JobInfo::new(&descriptor, Some(Arc::clone(&slot))));
        let registration = Registration::new(&self.inner, &job, &monitor);
        job.transition(JobState::WaitingForPermit, None);

        tracing::info!(
            job_id = job.id(),
            job_name = %job.name(),
            monitor_id = monitor.id(),
            mutex = ?slot.key(),
            "Job scheduled"
        );

        let inner = Arc::clone(&self.inner);
        let task_job = Arc::clone(&job);
        let task_monitor = monitor.clone();
        let task = self.inner.tracker.spawn(async move {
            let acquired = tokio::select! {
                biased;
                () = task_monitor.cancelled() => Err(JobError::Cancelled),
                acquired = slot.acquire(place) => acquired,
            };

            let result = match acquired {
                Ok(()) => {
                    inner
                        .execute(Arc::clone(&task_job), task_monitor, descriptor, unit)
                        .await
                }
                Err(err) => {
                    tracing::info!(
                        job_id = task_job.id(),
                        job_name = %task_job.name(),
                        "Job cancelled before it started"
                    );
                    Err(err)
                }
            };

            slot.release();
            drop(registration);
            task_job.finish(&result);
            tracing::info!(
                job_id = task_job.id(),
                job_name = %task_job.name(),
                outcome = ?task_job.outcome(),
                "Job finished"
            );
            result
        });

        Ok(JobHandle::new(job, monitor, task))
    }

    /// Cancel every root job registered under (`job_id`, `session_id`).
    /// Returns true if at least one moved to cancelled.
    pub fn cancel(&self, job_id: u64, session_id: Option<&str>) -> bool {
        self.inner.registry.cancel(job_id, session_id)
    }

    pub fn cancel_all_by_session(&self, session_id: &str) -> bool {
        self.inner.registry.cancel_all_by_session(session_id)
    }

    pub fn cancel_all_by_session_and_request_id(&self, session_id: &str, request_id: &str) -> bool {
        self.inner
            .registry
            .cancel_all_by_session_and_request_id(session_id, request_id)
    }

    /// Make `monitor` reachable through (`session_id`, `request_id`) until the
    /// handle is dropped or unregistered.
    pub fn register(&self, monitor: &RunMonitor, session_id: &str, request_id: &str) -> RegistryHandle {
        self.inner.registry.register(monitor, session_id, request_id)
    }

    pub fn unregister(&self, handle: RegistryHandle) {
        self.inner.registry.unregister(handle);
    }

    /// Jobs that are queued or running.
    pub fn running_jobs(&self) -> Vec<Arc<JobInfo>> {
        self.inner.registry.jobs()
    }

    pub fn is_running(&self, job_id: u64) -> bool {
        self.running_jobs().iter().any(|job| job.id() == job_id)
    }

    /// Change how many jobs on `key` may run at once. Queued jobs are
    /// admitted right away when the count goes up; with zero, nothing new
    /// starts until it is raised again.
    pub fn set_permits(&self, key: MutexKey, permits: usize) {
        tracing::debug!(%key, permits, "Execution permits changed");
        self.inner.mutexes.set_permits(key, permits);
    }

    /// Jobs on `key` allowed to run at once (1 unless changed).
    pub fn permits(&self, key: &MutexKey) -> usize {
        self.inner.mutexes.permits(key)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Reject new submissions, cancel every root job, and wait up to the
    /// configured grace period for scheduled jobs to finish.
    pub async fn shutdown(&self) {
        let first = !self.inner.shut_down.swap(true, Ordering::SeqCst);
        if first {
            let cancelled = self
                .inner
                .tree
                .roots()
                .iter()
                .filter(|monitor| monitor.cancel())
                .count();
            tracing::info!(
                scheduler = %self.inner.config.name,
                cancelled,
                "Shutting down job scheduler"
            );
            self.inner.tracker.close();
        }

        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                scheduler = %self.inner.config.name,
                remaining = self.inner.tracker.len(),
                "Jobs still running after shutdown grace period"
            );
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(JobError::Shutdown {
                name: self.inner.config.name.clone(),
            });
        }
        Ok(())
    }
}

impl Inner {
    /// Build the chain for one job and drive it.
    async fn execute<T, F>(
        &self,
        job: Arc<JobInfo>,
        monitor: RunMonitor,
        descriptor: JobDescriptor,
        unit: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if monitor.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        job.transition(JobState::Running, None);

        let context = descriptor.context().clone();
        let factory = context
            .transaction_factory()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.transactions));
        let boundary = TransactionBoundary::new(context.transaction_scope(), factory)
            .with_members(context.transaction_members().to_vec());

        let chain = self
            .extensions
            .iter()
            .chain(descriptor.extensions())
            .fold(
                PropagationChain::new(decorators::core(ChainSetup {
                    job,
                    monitor,
                    context,
                    boundary,
                })),
                |chain, extension| chain.extend(extension),
            );

        chain.call(unit).await
    }
}

fn validate(descriptor: &JobDescriptor) -> Result<()> {
    if descriptor.session_required() && descriptor.context().session().is_none() {
        return Err(JobError::contract(format!(
            "job '{}' requires a session but its context has none",
            descriptor.name()
        )));
    }
    Ok(())
}

/// Scheduled jobs always carry a correlation id; generate one if missing.
fn with_correlation_id(descriptor: JobDescriptor) -> JobDescriptor {
    if descriptor.context().correlation_id().is_some() {
        return descriptor;
    }
    let context = descriptor
        .context()
        .clone()
        .with_correlation_id(Some(uuid::Uuid::new_v4().to_string()));
    descriptor.with_context(context)
}
