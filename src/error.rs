//! Error types for jobrun.

use std::any::Any;
use std::time::Duration;

/// Top-level error type for job execution.
///
/// Units of work return `Result<T, JobError>`. Business failures enter through
/// the `Business` variant (any `anyhow::Error` converts with `?`) and are handed
/// back to the caller unmodified.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A caller broke the submission contract (missing session, illegal
    /// transaction member registration, ...). Raised before the unit runs.
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Transaction required: no ambient transaction for MANDATORY scope")]
    TransactionRequired,

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Scheduler {name} is shut down")]
    Shutdown { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Business(#[from] anyhow::Error),
}

impl JobError {
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    /// True if this error is the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for job execution.
pub type Result<T> = std::result::Result<T, JobError>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
