//! Group executor: starts groups and walks a rollout's progression.
//!
//! [`GroupExecutor::advance`] is one step of the scheduler for a single
//! rollout: it moves a due rollout into Running, starts the next
//! eligible group, evaluates the running group, and applies the verdict.
//! Callers are expected to hold the rollout's lease and to run the
//! executor returned by [`GroupExecutor::fenced`] for it.

use std::sync::Arc;

use fleetgrid_state::{
    Action, ActionStatus, Fence, GroupState, IssuedActions, Rollout, RolloutGroup, RolloutState,
    StartPolicy, StateStore, TargetId,
};
use tracing::{debug, info, warn};

use crate::condition::{self, Verdict};
use crate::controller::{self, RolloutCommand};
use crate::dispatcher::ActionDispatcher;
use crate::error::{RolloutError, RolloutResult};

/// What one call to [`GroupExecutor::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub from: RolloutState,
    pub to: RolloutState,
    pub groups_started: u32,
    pub groups_settled: u32,
}

impl Advance {
    fn idle(state: RolloutState) -> Self {
        Self {
            from: state,
            to: state,
            groups_started: 0,
            groups_settled: 0,
        }
    }

    pub fn progressed(&self) -> bool {
        self.from != self.to || self.groups_started > 0 || self.groups_settled > 0
    }
}

#[derive(Clone)]
pub struct GroupExecutor {
    store: StateStore,
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl GroupExecutor {
    pub fn new(store: StateStore, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// The same executor, with every write checked against `fence`.
    pub fn fenced(&self, fence: Fence) -> Self {
        Self {
            store: self.store.fenced(fence),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Issue one action per member target and mark the group Running.
    ///
    /// A group that is already Running is returned unchanged.
    pub fn start_group(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        now: u64,
    ) -> RolloutResult<RolloutGroup> {
        match group.state {
            GroupState::Scheduled | GroupState::Ready => {}
            GroupState::Running => return Ok(group.clone()),
            GroupState::Finished | GroupState::Error => {
                return Err(RolloutError::InvalidTransition {
                    rollout: rollout.id.clone(),
                    from: rollout.state,
                    command: format!("start group {}", group.index),
                });
            }
        }

        let issued = self.issue(rollout, group, &group.targets, now)?;
        info!(
            rollout = %rollout.id,
            group = group.index,
            actions = issued.created.len(),
            "group started"
        );
        Ok(issued.group)
    }

    /// Create and dispatch actions for `targets` in `group`.
    ///
    /// Targets that already have an action in the group are skipped.
    pub fn issue(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        targets: &[TargetId],
        now: u64,
    ) -> RolloutResult<IssuedActions> {
        let actions: Vec<Action> = targets
            .iter()
            .map(|target| Action {
                id: Action::action_id(&group.id, target),
                rollout_id: rollout.id.clone(),
                group_id: group.id.clone(),
                target_id: target.clone(),
                distribution: rollout.distribution.clone(),
                action_type: rollout.action_type,
                status: ActionStatus::Created,
                weight: rollout.weight,
                created_at: now,
                last_status_at: now,
            })
            .collect();

        let issued = self.store.issue_actions(&group.id, &actions, now)?;
        for action in &issued.created {
            if let Err(e) = self.dispatcher.dispatch(action) {
                warn!(error = %e, "action stays pollable");
            }
        }
        Ok(issued)
    }

    /// Drive one rollout as far as its current state allows.
    pub fn advance(&self, rollout_id: &str, now: u64) -> RolloutResult<Advance> {
        let mut rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;

        let mut advance = Advance::idle(rollout.state);
        if rollout.deleted {
            return Ok(advance);
        }

        if rollout.state == RolloutState::Ready {
            if !is_due(&rollout.start_policy, now) {
                return Ok(advance);
            }
            controller::apply(&mut rollout, RolloutCommand::Start, now)?;
            self.store.put_rollout(&rollout)?;
        }
        if rollout.state == RolloutState::Starting {
            controller::apply(&mut rollout, RolloutCommand::Started, now)?;
            self.store.put_rollout(&rollout)?;
        }
        if rollout.state == RolloutState::Running {
            self.advance_groups(&mut rollout, &mut advance, now)?;
        }

        advance.to = rollout.state;
        Ok(advance)
    }

    fn advance_groups(
        &self,
        rollout: &mut Rollout,
        advance: &mut Advance,
        now: u64,
    ) -> RolloutResult<()> {
        let mut groups = self.store.list_groups(&rollout.id)?;

        for i in 0..groups.len() {
            match groups[i].state {
                GroupState::Finished => continue,
                GroupState::Error if groups[i].error_acknowledged => continue,
                GroupState::Error => {
                    debug!(rollout = %rollout.id, group = groups[i].index, "blocked on failed group");
                    return Ok(());
                }
                GroupState::Scheduled | GroupState::Ready => {
                    if i > 0 && !groups[i - 1].releases_successor() {
                        return Ok(());
                    }
                    let started = self.start_group(rollout, &groups[i], now)?;
                    groups[i] = started;
                    advance.groups_started += 1;
                }
                GroupState::Running => {
                    // Members appended without an action, e.g. by a live
                    // resolution interrupted between its two writes.
                    if groups[i].counts.total() < groups[i].target_count {
                        let issued = self.issue(rollout, &groups[i], &groups[i].targets, now)?;
                        if !issued.created.is_empty() {
                            warn!(
                                rollout = %rollout.id,
                                group = groups[i].index,
                                actions = issued.created.len(),
                                "issued missing actions"
                            );
                        }
                        groups[i] = issued.group;
                    }
                }
            }

            let group = &mut groups[i];
            let verdict = condition::evaluate(group);
            if !controller::settle_group(group, verdict, now) {
                // Still waiting on devices.
                return Ok(());
            }
            advance.groups_settled += 1;

            if verdict == Verdict::Failed {
                let command = RolloutCommand::GroupFailed(group.error_action);
                controller::apply(rollout, command, now)?;
                rollout.last_error = Some(format!(
                    "group {} met its error condition ({} of {} actions failed)",
                    group.index,
                    group.counts.error(),
                    group.counts.total()
                ));
                self.store.put_rollout_with_groups(rollout, &[&*group])?;
                return Ok(());
            }
            self.store.put_group(group)?;
        }

        controller::apply(rollout, RolloutCommand::AllGroupsFinished, now)?;
        self.store.put_rollout(rollout)?;
        Ok(())
    }
}

/// Whether the scheduler may start a Ready rollout.
pub fn is_due(policy: &StartPolicy, now: u64) -> bool {
    match policy {
        StartPolicy::Manual => false,
        StartPolicy::Scheduled { start_at } => now >= *start_at,
        StartPolicy::Auto => true,
    }
}
