//! jobrun: job execution with propagated context, two-phase commit
//! boundaries and hierarchical cancellation.

pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod monitor;
pub mod transaction;

pub use config::SchedulerConfig;
pub use context::{RunContext, Session};
pub use error::{JobError, Result};
pub use job::{BlockingCondition, JobDescriptor, JobHandle, JobScheduler, MutexKey};
pub use monitor::{Cancellable, CancellationRegistry, RunMonitor};
pub use transaction::{Transaction, TransactionMember, TransactionScope};
