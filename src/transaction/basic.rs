//! Default transaction implementation.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use uuid::Uuid;

use super::{MemberFactory, Transaction, TransactionFailure, TransactionMember, TransactionState};
use crate::error::{panic_message, JobError, Result};
use crate::monitor::Cancellable;

#[derive(Debug)]
struct Inner {
    state: TransactionState,
    failures: Vec<TransactionFailure>,
    members: Vec<Arc<dyn TransactionMember>>,
}

/// Transaction that fans every phase out to its registered members.
///
/// Each member is driven independently: an error or panic from one member is
/// logged, fails that phase, and the remaining members are still driven.
#[derive(Debug)]
pub struct BasicTransaction {
    id: Uuid,
    inner: Mutex<Inner>,
    cancelled: AtomicBool,
}

impl BasicTransaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                state: TransactionState::New,
                failures: Vec::new(),
                members: Vec::new(),
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransactionState) {
        self.lock().state = state;
    }

    fn members(&self) -> Vec<Arc<dyn TransactionMember>> {
        self.lock().members.clone()
    }

    fn committing_members(&self) -> Vec<Arc<dyn TransactionMember>> {
        self.lock()
            .members
            .iter()
            .filter(|member| member.needs_commit())
            .cloned()
            .collect()
    }

    fn check_accepts(&self, inner: &Inner, member_id: &str) -> Result<()> {
        if inner.state.accepts_members() {
            return Ok(());
        }
        Err(JobError::contract(format!(
            "cannot register member {member_id} on transaction {} in state {}",
            self.id, inner.state
        )))
    }

    /// Drive one member through one phase; `None` means the phase failed.
    async fn drive<T, Fut>(&self, member: &dyn TransactionMember, phase: &'static str, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::warn!(
                    transaction_id = %self.id,
                    member = member.member_id(),
                    phase,
                    error = %err,
                    "Transaction member failed"
                );
                None
            }
            Err(payload) => {
                tracing::error!(
                    transaction_id = %self.id,
                    member = member.member_id(),
                    phase,
                    panic = %panic_message(payload.as_ref()),
                    "Transaction member panicked"
                );
                None
            }
        }
    }
}

impl Default for BasicTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for BasicTransaction {
    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.add_failure(TransactionFailure::cancelled());
        tracing::debug!(transaction_id = %self.id, "Transaction cancelled");
        for member in self.members() {
            member.cancel();
        }
        true
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transaction for BasicTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> TransactionState {
        self.lock().state
    }

    fn add_failure(&self, failure: TransactionFailure) {
        self.lock().failures.push(failure);
    }

    fn failures(&self) -> Vec<TransactionFailure> {
        self.lock().failures.clone()
    }

    fn has_failures(&self) -> bool {
        !self.lock().failures.is_empty()
    }

    fn register_member(&self, member: Arc<dyn TransactionMember>) -> Result<()> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let mut inner = self.lock();
        self.check_accepts(&inner, member.member_id())?;
        inner.members.retain(|m| m.member_id() != member.member_id());
        inner.members.push(member);
        inner.state = TransactionState::Active;
        Ok(())
    }

    fn register_member_if_absent(
        &self,
        member_id: &str,
        create: MemberFactory<'_>,
    ) -> Result<Arc<dyn TransactionMember>> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if let Some(existing) = self.member(member_id) {
            return Ok(existing);
        }
        self.check_accepts(&self.lock(), member_id)?;

        // Built outside the lock; the factory may look at this transaction.
        let created = create(member_id);
        if created.member_id() != member_id {
            return Err(JobError::contract(format!(
                "factory for member {member_id} built member {}",
                created.member_id()
            )));
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.members.iter().find(|m| m.member_id() == member_id) {
            return Ok(Arc::clone(existing));
        }
        self.check_accepts(&inner, member_id)?;
        inner.members.push(Arc::clone(&created));
        inner.state = TransactionState::Active;
        Ok(created)
    }

    fn member(&self, member_id: &str) -> Option<Arc<dyn TransactionMember>> {
        self.lock()
            .members
            .iter()
            .find(|member| member.member_id() == member_id)
            .cloned()
    }

    async fn commit_phase1(&self) -> bool {
        self.set_state(TransactionState::Committing);
        let mut ok = !self.has_failures();
        for member in self.committing_members() {
            let vote = self.drive(member.as_ref(), "commit_phase1", member.commit_phase1()).await;
            ok &= vote == Some(true);
        }
        ok && !self.has_failures()
    }

    async fn commit_phase2(&self) -> bool {
        let mut ok = true;
        for member in self.committing_members() {
            ok &= self
                .drive(member.as_ref(), "commit_phase2", member.commit_phase2())
                .await
                .is_some();
        }
        ok
    }

    async fn rollback(&self) -> bool {
        if self.state() == TransactionState::Released {
            return true;
        }
        self.set_state(TransactionState::RollingBack);
        let mut ok = true;
        for member in self.members() {
            ok &= self
                .drive(member.as_ref(), "rollback", member.rollback())
                .await
                .is_some();
        }
        ok
    }

    async fn release(&self) -> bool {
        let members = {
            let mut inner = self.lock();
            inner.state = TransactionState::Released;
            std::mem::take(&mut inner.members)
        };
        let mut ok = true;
        for member in members {
            ok &= self
                .drive(member.as_ref(), "release", member.release())
                .await
                .is_some();
        }
        ok
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Member that counts every call and can be told to fail a phase.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMember {
        pub id: String,
        pub vote_no: bool,
        pub fail_phase2: bool,
        pub panic_on_rollback: bool,
        pub skip_commit: bool,
        pub phase1: AtomicUsize,
        pub phase2: AtomicUsize,
        pub rollbacks: AtomicUsize,
        pub releases: AtomicUsize,
        pub cancels: AtomicUsize,
    }

    impl RecordingMember {
        pub(crate) fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                ..Self::default()
            }
        }

        pub(crate) fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransactionMember for RecordingMember {
        fn member_id(&self) -> &str {
            &self.id
        }

        fn needs_commit(&self) -> bool {
            !self.skip_commit
        }

        async fn commit_phase1(&self) -> anyhow::Result<bool> {
            self.phase1.fetch_add(1, Ordering::SeqCst);
            Ok(!self.vote_no)
        }

        async fn commit_phase2(&self) -> anyhow::Result<()> {
            self.phase2.fetch_add(1, Ordering::SeqCst);
            if self.fail_phase2 {
                anyhow::bail!("disk full");
            }
            Ok(())
        }

        async fn rollback(&self) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_rollback {
                panic!("rollback exploded");
            }
            Ok(())
        }

        async fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&self) -> bool {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn commit_drives_both_phases() {
        let tx = BasicTransaction::new();
        let member = Arc::new(RecordingMember::new("db"));
        tx.register_member(member.clone()).unwrap();
        assert_eq!(tx.state(), TransactionState::Active);

        assert!(tx.commit_phase1().await);
        assert!(tx.commit_phase2().await);
        assert!(tx.release().await);

        assert_eq!(RecordingMember::count(&member.phase1), 1);
        assert_eq!(RecordingMember::count(&member.phase2), 1);
        assert_eq!(RecordingMember::count(&member.releases), 1);
        assert_eq!(tx.state(), TransactionState::Released);
    }

    #[tokio::test]
    async fn no_vote_fails_phase1_but_asks_everyone() {
        let tx = BasicTransaction::new();
        let no = Arc::new(RecordingMember {
            vote_no: true,
            ..RecordingMember::new("a")
        });
        let yes = Arc::new(RecordingMember::new("b"));
        tx.register_member(no.clone()).unwrap();
        tx.register_member(yes.clone()).unwrap();

        assert!(!tx.commit_phase1().await);
        assert_eq!(RecordingMember::count(&yes.phase1), 1);
    }

    #[tokio::test]
    async fn members_without_work_skip_commit() {
        let tx = BasicTransaction::new();
        let idle = Arc::new(RecordingMember {
            skip_commit: true,
            ..RecordingMember::new("idle")
        });
        tx.register_member(idle.clone()).unwrap();

        assert!(tx.commit_phase1().await);
        assert!(tx.commit_phase2().await);
        assert_eq!(RecordingMember::count(&idle.phase1), 0);
        assert_eq!(RecordingMember::count(&idle.phase2), 0);
    }

    #[tokio::test]
    async fn failing_member_does_not_stop_the_others() {
        let tx = BasicTransaction::new();
        let broken = Arc::new(RecordingMember {
            fail_phase2: true,
            panic_on_rollback: true,
            ..RecordingMember::new("broken")
        });
        let healthy = Arc::new(RecordingMember::new("healthy"));
        tx.register_member(broken.clone()).unwrap();
        tx.register_member(healthy.clone()).unwrap();

        assert!(!tx.commit_phase2().await);
        assert_eq!(RecordingMember::count(&healthy.phase2), 1);

        assert!(!tx.rollback().await);
        assert_eq!(RecordingMember::count(&healthy.rollbacks), 1);
        assert!(tx.release().await);
    }

    #[test]
    fn cancel_records_failure_and_cancels_members() {
        let tx = BasicTransaction::new();
        let member = Arc::new(RecordingMember::new("db"));
        tx.register_member(member.clone()).unwrap();

        assert!(tx.cancel());
        assert!(!tx.cancel());
        assert!(tx.is_cancelled());
        assert_eq!(tx.failures(), vec![TransactionFailure::cancelled()]);
        assert_eq!(RecordingMember::count(&member.cancels), 1);
        assert!(matches!(
            tx.register_member(Arc::new(RecordingMember::new("late"))),
            Err(JobError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn registration_after_release_is_rejected() {
        let tx = BasicTransaction::new();
        tx.release().await;
        let err = tx
            .register_member(Arc::new(RecordingMember::new("late")))
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn same_member_id_replaces() {
        let tx = BasicTransaction::new();
        tx.register_member(Arc::new(RecordingMember::new("db"))).unwrap();
        let second = Arc::new(RecordingMember::new("db"));
        tx.register_member(second.clone()).unwrap();

        let found = tx.member("db").unwrap();
        assert!(Arc::ptr_eq(&found, &(second as Arc<dyn TransactionMember>)));
        assert!(tx.member("other").is_none());
    }

    #[tokio::test]
    async fn rollback_after_release_is_a_no_op() {
        let tx = BasicTransaction::new();
        let member = Arc::new(RecordingMember::new("db"));
        tx.register_member(member.clone()).unwrap();
        tx.release().await;
        assert!(tx.rollback().await);
        assert_eq!(RecordingMember::count(&member.rollbacks), 0);
    }

    fn recording(id: &str) -> Arc<dyn TransactionMember> {
        Arc::new(RecordingMember::new(id))
    }

    #[test]
    fn register_if_absent_creates_once() {
        let tx = BasicTransaction::new();
        let first = tx
            .register_member_if_absent("db", Box::new(recording))
            .unwrap();
        assert_eq!(tx.state(), TransactionState::Active);

        let again = tx
            .register_member_if_absent(
                "db",
                Box::new(|_: &str| -> Arc<dyn TransactionMember> {
                    panic!("factory must not run for a registered member")
                }),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn register_if_absent_fails_on_cancelled_transaction() {
        let tx = BasicTransaction::new();
        tx.cancel();
        let err = tx
            .register_member_if_absent(
                "db",
                Box::new(|_: &str| -> Arc<dyn TransactionMember> {
                    panic!("factory must not run on a cancelled transaction")
                }),
            )
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(tx.member("db").is_none());
    }

    #[test]
    fn register_if_absent_and_not_cancelled() {
        let tx = BasicTransaction::new();
        let member = tx
            .register_member_if_absent_and_not_cancelled("db", Box::new(recording))
            .unwrap();
        assert!(member.is_some());

        let cancelled = BasicTransaction::new();
        cancelled.cancel();
        let none = cancelled
            .register_member_if_absent_and_not_cancelled(
                "db",
                Box::new(|_: &str| -> Arc<dyn TransactionMember> {
                    panic!("factory must not run on a cancelled transaction")
                }),
            )
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn register_if_absent_rejects_mismatched_member_id() {
        let tx = BasicTransaction::new();
        let err = tx
            .register_member_if_absent("db", Box::new(|_: &str| recording("queue")))
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert!(tx.member("queue").is_none());
    }
}
