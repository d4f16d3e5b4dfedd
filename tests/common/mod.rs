//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use jobrun::context::BasicSession;
use jobrun::job::JobState;
use jobrun::transaction::TransactionMember;
use jobrun::{JobDescriptor, JobScheduler, RunContext, SchedulerConfig, TransactionScope};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction member that counts how often each phase ran.
#[derive(Debug, Default)]
pub struct CountingMember {
    id: String,
    pub prepares: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub releases: AtomicUsize,
}

impl CountingMember {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ..Self::default()
        })
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionMember for CountingMember {
    fn member_id(&self) -> &str {
        &self.id
    }

    async fn commit_phase1(&self) -> anyhow::Result<bool> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn commit_phase2(&self) -> anyhow::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn scheduler() -> JobScheduler {
    JobScheduler::new(SchedulerConfig::default())
}

pub fn session_context(session_id: &str) -> RunContext {
    RunContext::empty().with_session(Some(BasicSession::new(session_id).shared()))
}

/// Descriptor for a job in `session_id` that starts its own transaction with
/// `member` registered.
pub fn transactional(
    name: &str,
    id: u64,
    session_id: &str,
    member: &Arc<CountingMember>,
) -> JobDescriptor {
    let context = session_context(session_id)
        .with_transaction_scope(TransactionScope::RequiresNew)
        .with_transaction_member(member.clone());
    JobDescriptor::new(name).with_id(id).with_context(context)
}

/// Poll `condition` until it holds or `TEST_TIMEOUT` expires.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// True once a registered job with `id` is parked on a blocking condition.
pub fn is_parked(scheduler: &JobScheduler, id: u64) -> bool {
    scheduler
        .running_jobs()
        .iter()
        .any(|job| job.id() == id && job.state() == JobState::WaitingForBlockingCondition)
}
