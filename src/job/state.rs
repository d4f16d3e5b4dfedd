//! Job state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, not started.
    Scheduled,
    /// Queued behind its mutex key or the pool capacity.
    WaitingForPermit,
    /// Body is executing.
    Running,
    /// Parked on a blocking condition with its mutex released.
    WaitingForBlockingCondition,
    /// Finished with a result, an error, or cancellation.
    Done,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Scheduled (inline jobs skip the queue)
            (Scheduled, WaitingForPermit) | (Scheduled, Running) | (Scheduled, Done) |
            // From WaitingForPermit (cancelled while queued)
            (WaitingForPermit, Running) | (WaitingForPermit, Done) |
            // From Running
            (Running, WaitingForBlockingCondition) | (Running, Done) |
            // From WaitingForBlockingCondition
            (WaitingForBlockingCondition, Running)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::WaitingForPermit => "waiting_for_permit",
            Self::Running => "running",
            Self::WaitingForBlockingCondition => "waiting_for_blocking_condition",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// How a finished job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobOutcome {
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl JobOutcome {
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(err) if err.is_cancelled() => Self::Cancelled,
            Err(err) => Self::Failed {
                message: err.to_string(),
            },
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: JobState,
    /// New state.
    pub to: JobState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// State, timestamps and transition history of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobLifecycle {
    /// Current state.
    pub state: JobState,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the body first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached `Done`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the chain has produced a result.
    pub outcome: Option<JobOutcome>,
    /// State transition history.
    pub transitions: Vec<StateTransition>,
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self {
            state: JobState::Scheduled,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: JobState,
        reason: Option<String>,
    ) -> std::result::Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        // Blocking waits can bounce between Running and waiting many times
        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;

        match new_state {
            JobState::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobState::Done => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Get the duration since the body started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
