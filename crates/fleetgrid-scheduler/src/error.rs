//! Scheduler error types.

use fleetgrid_rollout::RolloutError;
use fleetgrid_state::StateError;
use thiserror::Error;

/// Errors that can occur while scheduling or cleaning up rollouts.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("rollout {rollout} is locked by {holder}")]
    LockContention { rollout: String, holder: String },

    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl SchedulerError {
    /// A fenced write was refused because the lease changed hands.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Fenced(_))
                | Self::Rollout(RolloutError::Persistence(StateError::Fenced(_)))
        )
    }

    /// Failures that count against a rollout's retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockContention { .. } => false,
            Self::Rollout(e) => e.is_transient(),
            Self::State(_) => true,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
