//! Live target resolution.
//!
//! Rollouts in live mode re-resolve their filter while running. Targets
//! that match now but are not in any group join the final group, as long
//! as that group has not finished. If the final group is already running
//! the new targets get their actions immediately.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_core::QuotaConfig;
use fleetgrid_rollout::partition::check_growth;
use fleetgrid_rollout::{GroupExecutor, RolloutError, RolloutResult, TargetResolver};
use fleetgrid_state::{Fence, GroupState, ResolveMode, Rollout, RolloutState, StateStore, TargetId};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct LiveResolver {
    store: StateStore,
    resolver: Arc<dyn TargetResolver>,
    executor: GroupExecutor,
    quota: QuotaConfig,
    interval: Duration,
}

impl LiveResolver {
    pub fn new(
        store: StateStore,
        resolver: Arc<dyn TargetResolver>,
        executor: GroupExecutor,
        quota: QuotaConfig,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            quota,
            interval,
        }
    }

    /// The same resolver, with every write checked against `fence`.
    pub fn fenced(&self, fence: Fence) -> Self {
        Self {
            store: self.store.fenced(fence.clone()),
            resolver: self.resolver.clone(),
            executor: self.executor.fenced(fence),
            quota: self.quota,
            interval: self.interval,
        }
    }

    /// Whether `rollout` is due for re-resolution at `now`.
    pub fn is_due(&self, rollout: &Rollout, now: u64) -> bool {
        rollout.resolve_mode == ResolveMode::Live
            && rollout.state == RolloutState::Running
            && !rollout.deleted
            && now.saturating_sub(rollout.last_resolved_at) >= self.interval.as_secs()
    }

    /// Re-resolve the rollout's filter and append new targets to its
    /// final group. Returns the number of targets added.
    ///
    /// The caller must hold the rollout's lease. If issuing fails after the
    /// append committed, the executor issues the missing actions on its
    /// next pass over the group.
    pub fn refresh(&self, rollout_id: &str, now: u64) -> RolloutResult<u32> {
        let mut rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;
        if !self.is_due(&rollout, now) {
            return Ok(0);
        }

        let groups = self.store.list_groups(rollout_id)?;
        let known: BTreeSet<&TargetId> = groups.iter().flat_map(|g| &g.targets).collect();
        let fresh: Vec<TargetId> = self
            .resolver
            .resolve(&rollout.target_filter)?
            .into_iter()
            .filter(|t| !known.contains(t))
            .collect();

        let added = match groups.last() {
            None => 0,
            Some(_) if fresh.is_empty() => 0,
            Some(last) if last.state.is_done() => {
                debug!(rollout = %rollout_id, new = fresh.len(), "final group done, new targets not added");
                0
            }
            Some(last) => {
                match check_growth(last.target_count, rollout.total_targets, fresh.len() as u32, &self.quota) {
                    Ok(()) => {
                        let (updated, group) = self.store.append_group_targets(&last.id, &fresh)?;
                        if group.state == GroupState::Running {
                            self.executor.issue(&updated, &group, &fresh, now)?;
                        }
                        info!(
                            rollout = %rollout_id,
                            group = group.index,
                            added = fresh.len(),
                            total = updated.total_targets,
                            "live targets appended"
                        );
                        rollout = updated;
                        fresh.len() as u32
                    }
                    Err(e) => {
                        warn!(rollout = %rollout_id, error = %e, "live targets not added");
                        0
                    }
                }
            }
        };

        rollout.last_resolved_at = now;
        self.store.put_rollout(&rollout)?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fleetgrid_core::FleetConfig;
    use fleetgrid_rollout::{
        CreateRollout, GroupSpec, NoopDispatcher, RolloutManager, StoreTargetResolver,
    };
    use fleetgrid_state::{StartPolicy, Target};

    fn add_target(store: &StateStore, id: &str) {
        store
            .put_target(&Target {
                id: id.to_string(),
                name: id.to_string(),
                attributes: BTreeMap::new(),
                tags: vec!["fleet".to_string()],
                registered_at: 0,
                last_poll_at: None,
            })
            .unwrap();
    }

    struct Fixture {
        store: StateStore,
        executor: GroupExecutor,
        live: LiveResolver,
    }

    fn fixture(quota: QuotaConfig) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..4 {
            add_target(&store, &format!("dev-{i}"));
        }
        let resolver = Arc::new(StoreTargetResolver::new(store.clone()));
        let manager = RolloutManager::new(store.clone(), resolver.clone(), &FleetConfig::default());
        let mut request = CreateRollout::new("live", "tag==fleet", "fw-9", GroupSpec::Count(2));
        request.resolve_mode = ResolveMode::Live;
        request.start_policy = StartPolicy::Auto;
        manager.create(request).unwrap();

        let executor = GroupExecutor::new(store.clone(), Arc::new(NoopDispatcher));
        let live = LiveResolver::new(store.clone(), resolver, executor.clone(), quota, Duration::ZERO);
        Fixture { store, executor, live }
    }

    #[test]
    fn new_targets_join_final_group() {
        let f = fixture(QuotaConfig::default());
        f.executor.advance("live", 1).unwrap();
        add_target(&f.store, "dev-9");

        assert_eq!(f.live.refresh("live", 2).unwrap(), 1);
        let rollout = f.store.get_rollout("live").unwrap().unwrap();
        let groups = f.store.list_groups("live").unwrap();
        assert_eq!(rollout.total_targets, 5);
        assert_eq!(groups[1].target_count, 3);
        assert!(groups[1].targets.contains(&"dev-9".to_string()));
        assert_eq!(
            groups.iter().map(|g| g.target_count).sum::<u32>(),
            rollout.total_targets
        );
        // Final group has not started, so no action yet.
        assert!(f.store.list_actions_for_target("dev-9").unwrap().is_empty());

        // Nothing new the second time.
        assert_eq!(f.live.refresh("live", 3).unwrap(), 0);
    }

    #[test]
    fn running_final_group_gets_actions_immediately() {
        let f = fixture(QuotaConfig::default());
        let mut groups = f.store.list_groups("live").unwrap();
        // Collapse to a single running group.
        let rollout = f.store.get_rollout("live").unwrap().unwrap();
        f.executor.start_group(&rollout, &groups[1], 1).unwrap();
        groups[0].state = GroupState::Finished;
        f.store.put_group(&groups[0]).unwrap();
        let mut rollout = rollout;
        rollout.state = RolloutState::Running;
        f.store.put_rollout(&rollout).unwrap();

        add_target(&f.store, "dev-7");
        assert_eq!(f.live.refresh("live", 2).unwrap(), 1);

        let actions = f.store.list_actions_for_target("dev-7").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].group_id, groups[1].id);
        let group = f.store.get_group(&groups[1].id).unwrap().unwrap();
        assert_eq!(group.counts.total(), group.target_count);
    }

    #[test]
    fn quota_blocks_growth() {
        let quota = QuotaConfig {
            max_groups_per_rollout: 10,
            max_actions_per_group: 2,
            max_actions_per_rollout: 100,
        };
        let f = fixture(quota);
        f.executor.advance("live", 1).unwrap();
        add_target(&f.store, "dev-8");

        assert_eq!(f.live.refresh("live", 2).unwrap(), 0);
        let rollout = f.store.get_rollout("live").unwrap().unwrap();
        assert_eq!(rollout.total_targets, 4);
        assert_eq!(rollout.last_resolved_at, 2);
    }

    #[test]
    fn snapshot_rollouts_are_not_due() {
        let f = fixture(QuotaConfig::default());
        let mut rollout = f.store.get_rollout("live").unwrap().unwrap();
        rollout.state = RolloutState::Running;
        assert!(f.live.is_due(&rollout, 10));
        rollout.resolve_mode = ResolveMode::Snapshot;
        assert!(!f.live.is_due(&rollout, 10));
    }
}
