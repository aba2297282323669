//! Rollout controller: the rollout and group state machines.
//!
//! Every rollout state change goes through [`apply`], which checks the
//! command against the transition table and stamps `updated_at`. Group
//! state changes driven by condition verdicts go through [`settle_group`].

use std::fmt;

use fleetgrid_state::{ErrorAction, GroupOutcome, GroupState, Rollout, RolloutGroup, RolloutState};
use tracing::{debug, info, warn};

use crate::condition::Verdict;
use crate::error::{RolloutError, RolloutResult};

/// Commands and events that move a rollout between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutCommand {
    /// Partitioning and quota checks passed.
    Created { approval_required: bool },
    Approve,
    Deny,
    Start,
    /// The scheduler picked up a starting rollout.
    Started,
    Pause,
    Resume,
    Stop,
    /// A group met its error condition.
    GroupFailed(ErrorAction),
    /// Transient failures exceeded the retry budget.
    RetriesExhausted,
    AllGroupsFinished,
    Delete,
    /// Cleanup removed every group.
    Purged,
}

impl fmt::Display for RolloutCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created { .. } => "complete creation",
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Start => "start",
            Self::Started => "run",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::GroupFailed(ErrorAction::Pause) => "pause on group error",
            Self::GroupFailed(ErrorAction::Stop) => "stop on group error",
            Self::RetriesExhausted => "give up after retries",
            Self::AllGroupsFinished => "finish",
            Self::Delete => "delete",
            Self::Purged => "purge",
        };
        f.write_str(s)
    }
}

/// The rollout transition table. `None` means the command is not
/// accepted in `from`.
pub fn next_state(from: RolloutState, command: RolloutCommand) -> Option<RolloutState> {
    use RolloutCommand as C;
    use RolloutState as S;

    let to = match (from, command) {
        (S::Creating, C::Created { approval_required: true }) => S::WaitingForApproval,
        (S::Creating, C::Created { approval_required: false }) => S::Ready,
        (S::WaitingForApproval, C::Approve) => S::Ready,
        (S::WaitingForApproval, C::Deny) => S::ApprovalDenied,
        (S::Ready, C::Start) => S::Starting,
        (S::Starting, C::Started) => S::Running,
        (S::Running, C::Pause) => S::Paused,
        (S::Running, C::GroupFailed(ErrorAction::Pause)) => S::Paused,
        (S::Paused, C::Resume) => S::Running,
        (S::Running | S::Paused | S::Starting, C::Stop) => S::Stopped,
        (S::Running, C::GroupFailed(ErrorAction::Stop)) => S::Error,
        (S::Running | S::Starting, C::RetriesExhausted) => S::Error,
        (S::Running, C::AllGroupsFinished) => S::Finished,
        (S::Deleting | S::Deleted, C::Delete) => return None,
        (_, C::Delete) => S::Deleting,
        (S::Deleting, C::Purged) => S::Deleted,
        _ => return None,
    };
    Some(to)
}

/// Apply `command` to `rollout`, returning the new state.
pub fn apply(rollout: &mut Rollout, command: RolloutCommand, now: u64) -> RolloutResult<RolloutState> {
    let from = rollout.state;
    let Some(to) = next_state(from, command) else {
        return Err(RolloutError::InvalidTransition {
            rollout: rollout.id.clone(),
            from,
            command: command.to_string(),
        });
    };

    if command == RolloutCommand::Delete {
        rollout.deleted = true;
    }
    if matches!(command, RolloutCommand::Resume | RolloutCommand::Start) {
        rollout.last_error = None;
    }
    rollout.state = to;
    rollout.updated_at = now;
    info!(rollout = %rollout.id, %from, %to, "rollout state changed");
    Ok(to)
}

/// Record a verdict on a running group. Returns true if the group
/// left Running.
pub fn settle_group(group: &mut RolloutGroup, verdict: Verdict, now: u64) -> bool {
    if group.state != GroupState::Running {
        return false;
    }
    let (state, outcome) = match verdict {
        Verdict::Pending => return false,
        Verdict::Succeeded => (GroupState::Finished, Some(GroupOutcome::Success)),
        Verdict::Degraded => (GroupState::Finished, Some(GroupOutcome::Degraded)),
        Verdict::Failed => (GroupState::Error, None),
    };
    group.state = state;
    group.outcome = outcome;
    group.finished_at = Some(now);

    match verdict {
        Verdict::Failed => warn!(
            rollout = %group.rollout_id,
            group = group.index,
            errors = group.counts.error(),
            total = group.counts.total(),
            "group met its error condition"
        ),
        Verdict::Degraded => warn!(
            rollout = %group.rollout_id,
            group = group.index,
            success = group.counts.success(),
            total = group.counts.total(),
            "group finished without meeting its success condition"
        ),
        _ => info!(
            rollout = %group.rollout_id,
            group = group.index,
            success = group.counts.success(),
            total = group.counts.total(),
            "group finished"
        ),
    }
    true
}

/// Force a running group to Finished on operator request.
pub fn trigger_group(group: &mut RolloutGroup, now: u64) -> bool {
    if group.state != GroupState::Running {
        return false;
    }
    group.state = GroupState::Finished;
    group.outcome = Some(GroupOutcome::Triggered);
    group.finished_at = Some(now);
    debug!(rollout = %group.rollout_id, group = group.index, "group triggered");
    true
}

/// Let the group after a paused-on-error group start once the rollout resumes.
pub fn acknowledge_error(group: &mut RolloutGroup) -> bool {
    if group.state == GroupState::Error && group.error_action == ErrorAction::Pause {
        group.error_acknowledged = true;
        return true;
    }
    false
}
