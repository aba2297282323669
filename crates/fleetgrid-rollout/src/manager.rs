//! Operator commands.
//!
//! `RolloutManager` validates and creates rollouts and maps each operator
//! command onto a state machine transition. Commands that change a
//! rollout take its lease for the duration of the change, so they never
//! interleave with a scheduler cycle working on the same rollout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fleetgrid_core::{FleetConfig, QuotaConfig, RolloutDefaults, epoch_millis, epoch_secs};
use fleetgrid_state::{
    Action, ActionType, Condition, ErrorAction, Fence, GroupState, Lease, LeaseGrant, ResolveMode,
    Rollout, RolloutGroup, RolloutState, StartPolicy, StateError, StateStore, StatusCounts,
};
use tracing::{info, warn};

use crate::controller::{self, RolloutCommand};
use crate::error::{RolloutError, RolloutResult};
use crate::partition::{self, GroupSpec};
use crate::resolver::TargetResolver;

const MAX_NAME_LEN: usize = 64;

/// Distinguishes managers inside one process; each holds leases under its own owner.
static NEXT_MANAGER: AtomicU64 = AtomicU64::new(0);

/// Everything needed to create a rollout.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRollout {
    pub name: String,
    pub description: Option<String>,
    pub target_filter: String,
    pub distribution: String,
    pub groups: GroupSpec,
    pub success_condition: Condition,
    pub error_condition: Option<Condition>,
    pub error_action: ErrorAction,
    pub start_policy: StartPolicy,
    pub resolve_mode: ResolveMode,
    pub action_type: ActionType,
    pub weight: u32,
    /// Overrides `[rollout] approval_required` for this rollout.
    pub approval_required: Option<bool>,
}

impl CreateRollout {
    pub fn new(name: &str, target_filter: &str, distribution: &str, groups: GroupSpec) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            target_filter: target_filter.to_string(),
            distribution: distribution.to_string(),
            groups,
            success_condition: Condition::Threshold(100),
            error_condition: None,
            error_action: ErrorAction::Pause,
            start_policy: StartPolicy::Manual,
            resolve_mode: ResolveMode::Snapshot,
            action_type: ActionType::Forced,
            weight: 0,
            approval_required: None,
        }
    }
}

#[derive(Clone)]
pub struct RolloutManager {
    store: StateStore,
    resolver: Arc<dyn TargetResolver>,
    quota: QuotaConfig,
    defaults: RolloutDefaults,
    lease_ttl: Duration,
    owner: String,
}

impl RolloutManager {
    pub fn new(store: StateStore, resolver: Arc<dyn TargetResolver>, config: &FleetConfig) -> Self {
        Self {
            store,
            resolver,
            quota: config.quota,
            defaults: config.rollout.clone(),
            lease_ttl: config.scheduler.lock_ttl(),
            owner: format!(
                "manager-{}-{}",
                std::process::id(),
                NEXT_MANAGER.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Resolve, partition, and persist a new rollout.
    ///
    /// Fails synchronously on an invalid name, filter, group definition,
    /// condition, or quota violation; nothing is persisted in that case.
    pub fn create(&self, request: CreateRollout) -> RolloutResult<Rollout> {
        validate_name(&request.name)?;
        validate_condition("success", &request.success_condition)?;
        if let Some(error) = &request.error_condition {
            validate_condition("error", error)?;
        }
        if self.store.get_rollout(&request.name)?.is_some() {
            return Err(RolloutError::AlreadyExists(format!("rollout {}", request.name)));
        }

        let targets = self.resolver.resolve(&request.target_filter)?;
        let plans = partition::partition(&targets, &request.groups, &self.quota)?;

        let now = epoch_secs();
        let id = request.name.clone();
        let groups: Vec<RolloutGroup> = plans
            .into_iter()
            .enumerate()
            .map(|(i, plan)| {
                let index = i as u32;
                RolloutGroup {
                    id: RolloutGroup::group_id(&id, index),
                    rollout_id: id.clone(),
                    index,
                    name: format!("group-{}", index + 1),
                    target_count: plan.size(),
                    targets: plan.targets,
                    success_condition: request.success_condition,
                    error_condition: request.error_condition,
                    error_action: request.error_action,
                    state: GroupState::Scheduled,
                    outcome: None,
                    counts: StatusCounts::default(),
                    error_acknowledged: false,
                    started_at: None,
                    finished_at: None,
                }
            })
            .collect();

        let mut rollout = Rollout {
            id: id.clone(),
            name: request.name,
            description: request.description,
            target_filter: request.target_filter,
            distribution: request.distribution,
            group_ids: groups.iter().map(|g| g.id.clone()).collect(),
            total_targets: targets.len() as u32,
            state: RolloutState::Creating,
            error_action: request.error_action,
            start_policy: request.start_policy,
            resolve_mode: request.resolve_mode,
            action_type: request.action_type,
            weight: request.weight,
            deleted: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            last_resolved_at: now,
        };
        let approval_required = request
            .approval_required
            .unwrap_or(self.defaults.approval_required);
        controller::apply(&mut rollout, RolloutCommand::Created { approval_required }, now)?;

        self.store
            .create_rollout(&rollout, &groups)
            .map_err(|e| match e {
                StateError::Conflict(what) => RolloutError::AlreadyExists(what),
                other => RolloutError::Persistence(other),
            })?;

        info!(
            rollout = %rollout.id,
            targets = rollout.total_targets,
            groups = groups.len(),
            state = %rollout.state,
            "rollout created"
        );
        Ok(rollout)
    }

    // ── Commands ───────────────────────────────────────────────────

    pub fn approve(&self, id: &str) -> RolloutResult<Rollout> {
        self.command(id, RolloutCommand::Approve)
    }

    pub fn deny(&self, id: &str) -> RolloutResult<Rollout> {
        self.command(id, RolloutCommand::Deny)
    }

    /// Hand a Ready rollout to the scheduler.
    pub fn start(&self, id: &str) -> RolloutResult<Rollout> {
        self.command(id, RolloutCommand::Start)
    }

    /// Stop starting new groups. Issued actions keep running.
    pub fn pause(&self, id: &str) -> RolloutResult<Rollout> {
        self.command(id, RolloutCommand::Pause)
    }

    /// Resume a paused rollout.
    ///
    /// The running group is re-evaluated on the next cycle. A group that
    /// failed with the PAUSE error action is acknowledged, which lets the
    /// group after it start.
    pub fn resume(&self, id: &str) -> RolloutResult<Rollout> {
        self.with_lease(id, |store, mut rollout| {
            let now = epoch_secs();
            controller::apply(&mut rollout, RolloutCommand::Resume, now)?;
            let mut acknowledged = Vec::new();
            for mut group in store.list_groups(id)? {
                if !group.error_acknowledged && controller::acknowledge_error(&mut group) {
                    info!(rollout = %id, group = group.index, "group error acknowledged");
                    acknowledged.push(group);
                }
            }
            let refs: Vec<&RolloutGroup> = acknowledged.iter().collect();
            store.put_rollout_with_groups(&rollout, &refs)?;
            Ok(rollout)
        })
    }

    /// Stop the rollout and ask devices to cancel unfinished actions.
    pub fn stop(&self, id: &str) -> RolloutResult<Rollout> {
        self.with_lease(id, |store, mut rollout| {
            let now = epoch_secs();
            controller::apply(&mut rollout, RolloutCommand::Stop, now)?;
            let canceling = store.stop_rollout(&rollout, now)?;
            info!(rollout = %id, canceling, "rollout stopped");
            Ok(rollout)
        })
    }

    /// Flag the rollout deleted. Groups and actions are reclaimed later by
    /// the cleanup collector.
    pub fn delete(&self, id: &str) -> RolloutResult<Rollout> {
        self.command(id, RolloutCommand::Delete)
    }

    /// Finish the running group now so the next one starts on the next
    /// cycle, regardless of its conditions.
    pub fn trigger_next_group(&self, id: &str) -> RolloutResult<RolloutGroup> {
        self.with_lease(id, |store, rollout| {
            let invalid = || RolloutError::InvalidTransition {
                rollout: id.to_string(),
                from: rollout.state,
                command: "trigger next group".to_string(),
            };
            if rollout.state != RolloutState::Running {
                return Err(invalid());
            }
            let mut group = store
                .list_groups(id)?
                .into_iter()
                .find(|g| g.state == GroupState::Running)
                .ok_or_else(invalid)?;
            controller::trigger_group(&mut group, epoch_secs());
            store.put_group(&group)?;
            info!(rollout = %id, group = group.index, "next group triggered");
            Ok(group)
        })
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))
    }

    pub fn list(&self) -> RolloutResult<Vec<Rollout>> {
        Ok(self.store.list_rollouts()?)
    }

    pub fn groups(&self, id: &str) -> RolloutResult<Vec<RolloutGroup>> {
        self.get(id)?;
        Ok(self.store.list_groups(id)?)
    }

    pub fn actions(&self, id: &str) -> RolloutResult<Vec<Action>> {
        self.get(id)?;
        Ok(self.store.list_actions_for_rollout(id)?)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn command(&self, id: &str, command: RolloutCommand) -> RolloutResult<Rollout> {
        self.with_lease(id, |store, mut rollout| {
            controller::apply(&mut rollout, command, epoch_secs())?;
            store.put_rollout(&rollout)?;
            Ok(rollout)
        })
    }

    /// Run `f` on the current rollout while holding its lease. Writes made
    /// through the store handed to `f` are fenced by that lease.
    fn with_lease<R>(
        &self,
        id: &str,
        f: impl FnOnce(&StateStore, Rollout) -> RolloutResult<R>,
    ) -> RolloutResult<R> {
        let key = Lease::rollout_key(id);
        let ttl_ms = self.lease_ttl.as_millis() as u64;
        let lease = match self
            .store
            .try_acquire_lease(&key, &self.owner, epoch_millis(), ttl_ms)?
        {
            LeaseGrant::Granted(lease) => lease,
            LeaseGrant::Held(lease) => {
                return Err(RolloutError::Busy {
                    rollout: id.to_string(),
                    holder: lease.owner,
                });
            }
        };

        let fenced = self.store.fenced(Fence {
            key: key.clone(),
            owner: self.owner.clone(),
            token: lease.fencing,
        });
        let result = self.get(id).and_then(|rollout| f(&fenced, rollout));

        match self.store.release_lease(&key, &self.owner, lease.fencing) {
            Ok(true) => {}
            Ok(false) => warn!(rollout = %id, "lease lost before release"),
            Err(e) => warn!(rollout = %id, error = %e, "lease release failed, leaving it to expire"),
        }
        result
    }
}

fn validate_condition(which: &str, condition: &Condition) -> RolloutResult<()> {
    match condition {
        Condition::Threshold(pct) if *pct > 100 => Err(RolloutError::InvalidGroupDefinition(
            format!("{which} threshold {pct} is above 100"),
        )),
        _ => Ok(()),
    }
}

/// Rollout names double as ids: `[a-z0-9][a-z0-9._-]*`, at most 64 chars.
pub fn validate_name(name: &str) -> RolloutResult<()> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let mut chars = name.chars();
    let ok = name.len() <= MAX_NAME_LEN
        && chars.next().is_some_and(valid_char)
        && chars.all(|c| valid_char(c) || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(RolloutError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fleetgrid_state::{ActionStatus, Target};

    use crate::resolver::StoreTargetResolver;

    fn manager(targets: usize) -> RolloutManager {
        manager_with(targets, FleetConfig::default())
    }

    fn manager_with(targets: usize, config: FleetConfig) -> RolloutManager {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..targets {
            store
                .put_target(&Target {
                    id: format!("dev-{i:03}"),
                    name: format!("device {i}"),
                    attributes: BTreeMap::new(),
                    tags: vec![if i % 2 == 0 { "even" } else { "odd" }.to_string()],
                    registered_at: 0,
                    last_poll_at: None,
                })
                .unwrap();
        }
        let resolver = Arc::new(StoreTargetResolver::new(store.clone()));
        RolloutManager::new(store, resolver, &config)
    }

    fn request(name: &str, groups: GroupSpec) -> CreateRollout {
        CreateRollout::new(name, "id==dev-*", "fw-3.0", groups)
    }

    #[test]
    fn create_snapshots_targets() {
        let m = manager(100);
        let rollout = m
            .create(request("fw-3", GroupSpec::Percentages(vec![10, 20, 70])))
            .unwrap();

        assert_eq!(rollout.state, RolloutState::Ready);
        assert_eq!(rollout.total_targets, 100);
        let groups = m.groups("fw-3").unwrap();
        let sizes: Vec<u32> = groups.iter().map(|g| g.target_count).collect();
        assert_eq!(sizes, vec![10, 20, 70]);
        assert_eq!(sizes.iter().sum::<u32>(), rollout.total_targets);
        assert_eq!(rollout.group_ids, groups.iter().map(|g| g.id.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn create_failures_persist_nothing() {
        let m = manager(10);
        let bad_filter = CreateRollout::new("a", "id=", "fw", GroupSpec::Count(1));
        assert!(matches!(m.create(bad_filter), Err(RolloutError::InvalidFilter(_))));

        let bad_groups = request("b", GroupSpec::Percentages(vec![50, 40]));
        assert!(matches!(
            m.create(bad_groups),
            Err(RolloutError::InvalidGroupDefinition(_))
        ));
        assert!(m.list().unwrap().is_empty());
    }

    #[test]
    fn explicit_groups_must_cover_the_resolved_set() {
        let m = manager(5);
        let partial = request(
            "partial",
            GroupSpec::Explicit(vec![vec!["dev-000".to_string()], vec!["dev-001".to_string()]]),
        );
        assert!(matches!(
            m.create(partial),
            Err(RolloutError::InvalidGroupDefinition(_))
        ));

        let ids: Vec<String> = (0..5).map(|i| format!("dev-{i:03}")).collect();
        let full = request(
            "full",
            GroupSpec::Explicit(vec![ids[..2].to_vec(), ids[2..].to_vec()]),
        );
        let rollout = m.create(full).unwrap();
        assert_eq!(rollout.total_targets, 5);
        let sizes: Vec<u32> = m.groups("full").unwrap().iter().map(|g| g.target_count).collect();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn thresholds_above_one_hundred_are_rejected() {
        let m = manager(2);
        let mut success = request("a", GroupSpec::Count(1));
        success.success_condition = Condition::Threshold(150);
        assert!(matches!(
            m.create(success),
            Err(RolloutError::InvalidGroupDefinition(_))
        ));

        let mut error = request("b", GroupSpec::Count(1));
        error.error_condition = Some(Condition::Threshold(101));
        assert!(matches!(
            m.create(error),
            Err(RolloutError::InvalidGroupDefinition(_))
        ));

        let mut edge = request("c", GroupSpec::Count(1));
        edge.error_condition = Some(Condition::Threshold(100));
        edge.success_condition = Condition::Count(100);
        m.create(edge).unwrap();
        assert_eq!(m.list().unwrap().len(), 1);
    }

    #[test]
    fn create_enforces_quota() {
        let mut config = FleetConfig::default();
        config.quota.max_actions_per_rollout = 5;
        config.quota.max_actions_per_group = 5;
        let m = manager_with(6, config);
        assert!(matches!(
            m.create(request("big", GroupSpec::Count(2))),
            Err(RolloutError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn names_are_validated_and_unique() {
        let m = manager(1);
        let long = "x".repeat(65);
        for bad in ["", "Upper", "-lead", "has space", long.as_str()] {
            assert!(matches!(
                m.create(request(bad, GroupSpec::Count(1))),
                Err(RolloutError::InvalidName(_))
            ));
        }
        m.create(request("ok.name_1-x", GroupSpec::Count(1))).unwrap();
        assert!(matches!(
            m.create(request("ok.name_1-x", GroupSpec::Count(1))),
            Err(RolloutError::AlreadyExists(_))
        ));
    }

    #[test]
    fn approval_gate() {
        let mut config = FleetConfig::default();
        config.rollout.approval_required = true;
        let m = manager_with(3, config);

        let r = m.create(request("gated", GroupSpec::Count(1))).unwrap();
        assert_eq!(r.state, RolloutState::WaitingForApproval);
        assert!(matches!(m.start("gated"), Err(RolloutError::InvalidTransition { .. })));
        assert_eq!(m.approve("gated").unwrap().state, RolloutState::Ready);

        let mut req = request("override", GroupSpec::Count(1));
        req.approval_required = Some(false);
        assert_eq!(m.create(req).unwrap().state, RolloutState::Ready);
    }

    #[test]
    fn commands_follow_state_machine() {
        let m = manager(4);
        m.create(request("fw", GroupSpec::Count(2))).unwrap();

        assert!(matches!(m.pause("fw"), Err(RolloutError::InvalidTransition { .. })));
        assert_eq!(m.start("fw").unwrap().state, RolloutState::Starting);
        assert!(matches!(m.resume("fw"), Err(RolloutError::InvalidTransition { .. })));
        assert!(matches!(m.get("missing"), Err(RolloutError::NotFound(_))));
        assert!(matches!(m.start("missing"), Err(RolloutError::NotFound(_))));
    }

    #[test]
    fn delete_flags_and_returns() {
        let m = manager(4);
        m.create(request("fw", GroupSpec::Count(2))).unwrap();

        let r = m.delete("fw").unwrap();
        assert!(r.deleted);
        assert_eq!(r.state, RolloutState::Deleting);
        // Groups stay until cleanup runs.
        assert_eq!(m.groups("fw").unwrap().len(), 2);
    }

    #[test]
    fn commands_release_the_lease() {
        let m = manager(2);
        m.create(request("fw", GroupSpec::Count(1))).unwrap();
        m.start("fw").unwrap();

        let lease = m.store().get_lease(&Lease::rollout_key("fw")).unwrap().unwrap();
        assert!(lease.is_expired(epoch_millis()));
    }

    #[test]
    fn busy_rollout_is_reported() {
        let m = manager(2);
        m.create(request("fw", GroupSpec::Count(1))).unwrap();
        m.store()
            .try_acquire_lease(&Lease::rollout_key("fw"), "worker-1", epoch_millis(), 60_000)
            .unwrap();

        match m.start("fw") {
            Err(RolloutError::Busy { holder, .. }) => assert_eq!(holder, "worker-1"),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    fn running_with_group(m: &RolloutManager) -> RolloutGroup {
        m.create(request("fw", GroupSpec::Count(2))).unwrap();
        let store = m.store();
        let mut rollout = store.get_rollout("fw").unwrap().unwrap();
        rollout.state = RolloutState::Running;
        store.put_rollout(&rollout).unwrap();

        let mut group = store.list_groups("fw").unwrap().remove(0);
        let actions: Vec<Action> = group
            .targets
            .iter()
            .map(|t| Action {
                id: Action::action_id(&group.id, t),
                rollout_id: "fw".to_string(),
                group_id: group.id.clone(),
                target_id: t.clone(),
                distribution: "fw-3.0".to_string(),
                action_type: ActionType::Forced,
                status: ActionStatus::Created,
                weight: 0,
                created_at: 0,
                last_status_at: 0,
            })
            .collect();
        group = store.issue_actions(&group.id, &actions, 1).unwrap().group;
        group
    }

    #[test]
    fn stop_cancels_open_actions() {
        let m = manager(4);
        let group = running_with_group(&m);
        let first = Action::action_id(&group.id, &group.targets[0]);
        m.store()
            .transition_action(&first, ActionStatus::FinishedSuccess, 2)
            .unwrap();

        assert_eq!(m.stop("fw").unwrap().state, RolloutState::Stopped);
        let counts = m.store().get_group(&group.id).unwrap().unwrap().counts;
        assert_eq!(counts.canceling, 1);
        assert_eq!(counts.finished_success, 1);
    }

    #[test]
    fn stop_after_losing_the_lease_changes_nothing() {
        let m = manager(4);
        let group = running_with_group(&m);
        let other = RolloutManager {
            owner: "manager-other".to_string(),
            ..m.clone()
        };

        // A manager whose lease expires while its closure runs cannot
        // commit once another holder takes over.
        let result = other.with_lease("fw", |store, mut rollout| {
            m.store()
                .try_acquire_lease(&Lease::rollout_key("fw"), "worker-9", u64::MAX / 2, 60_000)
                .unwrap();
            controller::apply(&mut rollout, RolloutCommand::Stop, epoch_secs())?;
            store.stop_rollout(&rollout, epoch_secs())?;
            Ok(rollout)
        });
        assert!(matches!(
            result,
            Err(RolloutError::Persistence(StateError::Fenced(_)))
        ));
        assert_eq!(m.get("fw").unwrap().state, RolloutState::Running);
        let counts = m.store().get_group(&group.id).unwrap().unwrap().counts;
        assert_eq!(counts.created, 2);
    }

    #[test]
    fn pause_keeps_actions() {
        let m = manager(4);
        let group = running_with_group(&m);

        assert_eq!(m.pause("fw").unwrap().state, RolloutState::Paused);
        let counts = m.store().get_group(&group.id).unwrap().unwrap().counts;
        assert_eq!(counts.created, 2);
        assert_eq!(m.actions("fw").unwrap().len(), 2);
    }

    #[test]
    fn resume_acknowledges_paused_error_group() {
        let m = manager(4);
        let mut group = running_with_group(&m);
        group.state = GroupState::Error;
        m.store().put_group(&group).unwrap();
        let mut rollout = m.get("fw").unwrap();
        rollout.state = RolloutState::Paused;
        m.store().put_rollout(&rollout).unwrap();

        assert_eq!(m.resume("fw").unwrap().state, RolloutState::Running);
        let group = m.store().get_group(&group.id).unwrap().unwrap();
        assert!(group.error_acknowledged);
        assert!(group.releases_successor());
    }

    #[test]
    fn trigger_next_group_finishes_running_group() {
        let m = manager(4);
        running_with_group(&m);

        let triggered = m.trigger_next_group("fw").unwrap();
        assert_eq!(triggered.state, GroupState::Finished);
        assert!(matches!(
            m.trigger_next_group("fw"),
            Err(RolloutError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn managers_in_one_process_do_not_share_leases() {
        let m = manager(4);
        running_with_group(&m);
        let other = RolloutManager::new(
            m.store().clone(),
            m.resolver.clone(),
            &FleetConfig::default(),
        );
        assert_ne!(m.owner, other.owner);

        let nested = m.with_lease("fw", |_, _| Ok(other.pause("fw"))).unwrap();
        assert!(matches!(nested, Err(RolloutError::Busy { .. })));
        assert_eq!(other.pause("fw").unwrap().state, RolloutState::Paused);
    }
}
