//! Transaction boundary: scope resolution and two-phase completion.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use super::{
    Transaction, TransactionFactory, TransactionFailure, TransactionMember, TransactionScope,
};
use crate::context::ambient;
use crate::error::{panic_message, JobError, Result};
use crate::monitor::Cancellable;

/// Adapter that lets the job's monitor cancel a transaction.
struct CancelTransaction(Arc<dyn Transaction>);

impl Cancellable for CancelTransaction {
    fn cancel(&self) -> bool {
        self.0.cancel()
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Runs a unit of work inside a transaction picked by `scope`.
///
/// Only a transaction this boundary started is completed here; a joined
/// ambient transaction is left to the boundary that owns it.
pub struct TransactionBoundary {
    scope: TransactionScope,
    factory: Arc<dyn TransactionFactory>,
    members: Vec<Arc<dyn TransactionMember>>,
}

impl TransactionBoundary {
    pub fn new(scope: TransactionScope, factory: Arc<dyn TransactionFactory>) -> Self {
        Self {
            scope,
            factory,
            members: Vec::new(),
        }
    }

    /// Members registered into the transaction when this boundary starts one.
    pub fn with_members(mut self, members: Vec<Arc<dyn TransactionMember>>) -> Self {
        self.members = members;
        self
    }

    pub fn scope(&self) -> TransactionScope {
        self.scope
    }

    /// Run `unit` and hand back its result unmodified.
    ///
    /// Errors and panics from the unit are recorded on the transaction first.
    /// A panic is re-raised after the owned transaction has been rolled back
    /// and released.
    pub async fn run<T, F>(&self, unit: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let (transaction, owned) = self.resolve()?;

        if owned && let Err(err) = self.register_members(&transaction) {
            complete(&transaction).await;
            return Err(err);
        }

        let registration = match (owned, ambient::monitor()) {
            (true, Some(monitor)) => {
                Some(monitor.register_cancellable(Arc::new(CancelTransaction(Arc::clone(&transaction)))))
            }
            _ => None,
        };

        let outcome = AssertUnwindSafe(ambient::scope_transaction(Some(Arc::clone(&transaction)), unit))
            .catch_unwind()
            .await;

        match &outcome {
            Ok(Err(err)) => transaction.add_failure(TransactionFailure::from(err)),
            Err(payload) => transaction.add_failure(TransactionFailure::new(format!(
                "panic: {}",
                panic_message(payload.as_ref())
            ))),
            Ok(Ok(_)) => {}
        }

        drop(registration);
        if owned {
            complete(&transaction).await;
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Pick the transaction for this run; true if this boundary owns it.
    fn resolve(&self) -> Result<(Arc<dyn Transaction>, bool)> {
        let joined = match (self.scope, ambient::transaction()) {
            (TransactionScope::Mandatory, None) => return Err(JobError::TransactionRequired),
            (TransactionScope::Mandatory | TransactionScope::Required, Some(tx)) => Some(tx),
            (TransactionScope::Required | TransactionScope::RequiresNew, _) => None,
        };

        match joined {
            Some(_) if !self.members.is_empty() => Err(JobError::contract(
                "transaction members can only be registered when a new transaction is started",
            )),
            Some(tx) => Ok((tx, false)),
            None => {
                let tx = self.factory.create()?;
                tracing::debug!(transaction_id = %tx.id(), scope = ?self.scope, "Transaction started");
                Ok((tx, true))
            }
        }
    }

    fn register_members(&self, transaction: &Arc<dyn Transaction>) -> Result<()> {
        for member in &self.members {
            transaction.register_member(Arc::clone(member))?;
        }
        Ok(())
    }
}

/// Commit if nothing failed, otherwise roll back; release in every case.
async fn complete(transaction: &Arc<dyn Transaction>) {
    let id = transaction.id();
    let committed = if transaction.has_failures() {
        false
    } else {
        guarded(transaction, "commit_phase1", transaction.commit_phase1()).await
            && guarded(transaction, "commit_phase2", transaction.commit_phase2()).await
    };

    if committed {
        tracing::debug!(transaction_id = %id, "Transaction committed");
    } else {
        tracing::debug!(
            transaction_id = %id,
            failures = transaction.failures().len(),
            "Rolling back transaction"
        );
        guarded(transaction, "rollback", transaction.rollback()).await;
    }

    guarded(transaction, "release", transaction.release()).await;
}

async fn guarded<Fut>(transaction: &Arc<dyn Transaction>, phase: &'static str, fut: Fut) -> bool
where
    Fut: Future<Output = bool>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(transaction_id = %transaction.id(), phase, "Transaction phase failed");
            false
        }
        Err(payload) => {
            tracing::error!(
                transaction_id = %transaction.id(),
                phase,
                panic = %panic_message(payload.as_ref()),
                "Transaction phase panicked"
            );
            false
        }
    }
}
