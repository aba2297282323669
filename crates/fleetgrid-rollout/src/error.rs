//! Rollout error types.

use fleetgrid_state::{RolloutState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid target filter: {0}")]
    InvalidFilter(String),

    #[error("invalid group definition: {0}")]
    InvalidGroupDefinition(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("rollout {rollout}: cannot {command} while {from}")]
    InvalidTransition {
        rollout: String,
        from: RolloutState,
        command: String,
    },

    #[error("invalid rollout name '{0}'")]
    InvalidName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("rollout {rollout} is busy (held by {holder})")]
    Busy { rollout: String, holder: String },

    #[error("status mailbox closed")]
    MailboxClosed,

    #[error("persistence error: {0}")]
    Persistence(#[from] StateError),
}

impl RolloutError {
    /// Errors worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Busy { .. })
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
