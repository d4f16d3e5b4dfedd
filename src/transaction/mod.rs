//! Transactions: two-phase commit around a unit of work.
//!
//! Core components:
//! - `basic`: Default transaction coordinating registered members
//! - `boundary`: Scope resolution and the commit/rollback/release protocol

pub mod basic;
pub mod boundary;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::monitor::Cancellable;

pub use basic::BasicTransaction;
pub use boundary::TransactionBoundary;

/// How a boundary picks the transaction its unit runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionScope {
    /// Join the ambient transaction; fail if there is none.
    Mandatory,
    /// Join the ambient transaction, or start a new one if there is none.
    #[default]
    Required,
    /// Always start a new transaction, shadowing the ambient one.
    RequiresNew,
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    New,
    Active,
    Committing,
    RollingBack,
    Released,
}

impl TransactionState {
    /// Members may still be added in this state.
    pub fn accepts_members(&self) -> bool {
        matches!(self, Self::New | Self::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
            Self::Released => "released",
        };
        write!(f, "{s}")
    }
}

/// A failure recorded on a transaction. Any recorded failure turns the
/// commit attempt into a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFailure {
    pub message: String,
    pub cancelled: bool,
}

impl TransactionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "transaction cancelled".to_string(),
            cancelled: true,
        }
    }
}

impl From<&JobError> for TransactionFailure {
    fn from(err: &JobError) -> Self {
        Self {
            message: err.to_string(),
            cancelled: err.is_cancelled(),
        }
    }
}

/// A resource taking part in a transaction (a database connection, a
/// message session, ...).
///
/// Errors returned here are logged by the transaction and turned into a
/// failed phase; they never escape the boundary.
#[async_trait]
pub trait TransactionMember: Send + Sync + fmt::Debug {
    /// Identifier used to look the member up inside its transaction.
    fn member_id(&self) -> &str;

    /// Members without pending work are skipped in both commit phases.
    fn needs_commit(&self) -> bool {
        true
    }

    /// Prepare. `Ok(false)` votes against the commit.
    async fn commit_phase1(&self) -> anyhow::Result<bool>;

    async fn commit_phase2(&self) -> anyhow::Result<()>;

    async fn rollback(&self) -> anyhow::Result<()>;

    /// Free the resource. Always called last, whatever the outcome.
    async fn release(&self) -> anyhow::Result<()>;

    /// Abort in-flight work. Returns true if something was aborted.
    fn cancel(&self) -> bool {
        false
    }
}

/// Builds the member for a member id on first registration.
pub type MemberFactory<'a> = Box<dyn FnOnce(&str) -> Arc<dyn TransactionMember> + 'a>;

/// Transaction coordinating a set of members.
///
/// A transaction is itself `Cancellable`: the boundary that creates one
/// registers it on the job's monitor, so cancelling the job records a
/// cancellation failure and cancels the members.
#[async_trait]
pub trait Transaction: Cancellable + fmt::Debug {
    fn id(&self) -> Uuid;

    fn state(&self) -> TransactionState;

    fn add_failure(&self, failure: TransactionFailure);

    fn failures(&self) -> Vec<TransactionFailure>;

    fn has_failures(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Add a member. A member with the same id replaces the earlier one.
    fn register_member(&self, member: Arc<dyn TransactionMember>) -> Result<()>;

    /// The member registered under `member_id`, or the one `create` builds
    /// and registers. `create` must return a member with that id. On a
    /// cancelled transaction this fails with `JobError::Cancelled` and
    /// `create` is never called.
    fn register_member_if_absent(
        &self,
        member_id: &str,
        create: MemberFactory<'_>,
    ) -> Result<Arc<dyn TransactionMember>>;

    /// Same as `register_member_if_absent`, but a cancelled transaction
    /// yields `Ok(None)`.
    fn register_member_if_absent_and_not_cancelled(
        &self,
        member_id: &str,
        create: MemberFactory<'_>,
    ) -> Result<Option<Arc<dyn TransactionMember>>> {
        match self.register_member_if_absent(member_id, create) {
            Ok(member) => Ok(Some(member)),
            Err(JobError::Cancelled) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn member(&self, member_id: &str) -> Option<Arc<dyn TransactionMember>>;

    /// Phase 1 over every member that needs a commit. True only if all voted yes.
    async fn commit_phase1(&self) -> bool;

    async fn commit_phase2(&self) -> bool;

    async fn rollback(&self) -> bool;

    async fn release(&self) -> bool;
}

/// Supplies the transaction a boundary starts.
pub trait TransactionFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Transaction>>;
}

impl<F> TransactionFactory for F
where
    F: Fn() -> Result<Arc<dyn Transaction>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Transaction>> {
        self()
    }
}

/// Factory producing a fresh `BasicTransaction` per boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTransactionFactory;

impl TransactionFactory for BasicTransactionFactory {
    fn create(&self) -> Result<Arc<dyn Transaction>> {
        Ok(Arc::new(BasicTransaction::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_is_required() {
        assert_eq!(TransactionScope::default(), TransactionScope::Required);
    }

    #[test]
    fn scope_serde_uses_constant_names() {
        let json = serde_json::to_string(&TransactionScope::RequiresNew).unwrap();
        assert_eq!(json, "\"REQUIRES_NEW\"");
        let parsed: TransactionScope = serde_json::from_str("\"MANDATORY\"").unwrap();
        assert_eq!(parsed, TransactionScope::Mandatory);
    }

    #[test]
    fn state_display() {
        assert_eq!(TransactionState::RollingBack.to_string(), "rolling_back");
        assert!(TransactionState::Active.accepts_members());
        assert!(!TransactionState::Released.accepts_members());
    }

    #[test]
    fn failure_from_error_keeps_cancellation() {
        let failure = TransactionFailure::from(&JobError::Cancelled);
        assert!(failure.cancelled);
        let failure = TransactionFailure::from(&JobError::contract("bad"));
        assert!(!failure.cancelled);
        assert!(failure.message.contains("bad"));
    }

    #[test]
    fn closures_are_factories() {
        let factory = || -> Result<Arc<dyn Transaction>> { Ok(Arc::new(BasicTransaction::new())) };
        let tx = factory.create().unwrap();
        assert_eq!(tx.state(), TransactionState::New);
        assert_eq!(BasicTransactionFactory.create().unwrap().state(), TransactionState::New);
    }
}
