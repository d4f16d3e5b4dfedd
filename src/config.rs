//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler name, used in logs and shutdown errors.
    pub name: String,
    /// Maximum number of scheduled jobs whose bodies run at the same time.
    pub max_concurrent_jobs: usize,
    /// How long `shutdown` waits for cancelled jobs to drain.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "jobrun".to_string(),
            max_concurrent_jobs: 64,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Build a configuration from `JOBRUN_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBRUN_NAME") {
            config.name = name;
        }

        if let Some(raw) = lookup("JOBRUN_MAX_CONCURRENT_JOBS") {
            let max: usize = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "JOBRUN_MAX_CONCURRENT_JOBS".to_string(),
                message: format!("{e}"),
            })?;
            if max == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "JOBRUN_MAX_CONCURRENT_JOBS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_concurrent_jobs = max;
        }

        if let Some(raw) = lookup("JOBRUN_SHUTDOWN_GRACE_MS") {
            let millis: u64 = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "JOBRUN_SHUTDOWN_GRACE_MS".to_string(),
                message: format!("{e}"),
            })?;
            config.shutdown_grace = Duration::from_millis(millis);
        }

        Ok(config)
    }
}
