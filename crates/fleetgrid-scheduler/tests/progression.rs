//! End-to-end rollout progression against an in-memory store.
//!
//! Drives rollouts through the manager, the scheduler, the aggregator and
//! the cleanup collector the way the daemon wires them, with synthetic
//! cycle timestamps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetgrid_core::{FleetConfig, SchedulerConfig};
use fleetgrid_rollout::{
    ActionDispatcher, Aggregator, CreateRollout, GroupExecutor, GroupSpec, NoopDispatcher,
    RecordingDispatcher, RolloutManager, StatusReport, StoreTargetResolver,
};
use fleetgrid_scheduler::{CleanupCollector, InFlightGrace, RolloutScheduler, StoreLock};
use fleetgrid_state::*;

fn test_store(targets: usize) -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    for i in 0..targets {
        store
            .put_target(&Target {
                id: format!("dev-{i:03}"),
                name: format!("device {i}"),
                attributes: BTreeMap::from([("hw".to_string(), "rev2".to_string())]),
                tags: vec!["fleet".to_string()],
                registered_at: 0,
                last_poll_at: None,
            })
            .unwrap();
    }
    store
}

fn manager(store: &StateStore) -> RolloutManager {
    let resolver = Arc::new(StoreTargetResolver::new(store.clone()));
    RolloutManager::new(store.clone(), resolver, &FleetConfig::default())
}

fn scheduler(
    store: &StateStore,
    worker: &str,
    dispatcher: Arc<dyn ActionDispatcher>,
) -> RolloutScheduler {
    let executor = GroupExecutor::new(store.clone(), dispatcher);
    let lock = Arc::new(StoreLock::new(store.clone(), worker, Duration::from_secs(30)));
    RolloutScheduler::new(store.clone(), executor, lock, SchedulerConfig::default())
}

fn auto_rollout(name: &str, groups: GroupSpec) -> CreateRollout {
    let mut request = CreateRollout::new(name, "tag==fleet", "fw-2.1", groups);
    request.start_policy = StartPolicy::Auto;
    request
}

/// Report `status` for every unfinished action in `group_id`, up to `limit`.
fn report_group(store: &StateStore, group_id: &str, status: ActionStatus, limit: usize, at: u64) {
    let aggregator = Aggregator::new(store.clone());
    let open = store
        .list_actions_for_group(group_id)
        .unwrap()
        .into_iter()
        .filter(|a| !a.status.is_terminal())
        .take(limit);
    for action in open {
        aggregator
            .apply(&StatusReport {
                action_id: action.id,
                status,
                reported_at: at,
            })
            .unwrap();
    }
}

fn sizes(groups: &[RolloutGroup]) -> Vec<u32> {
    groups.iter().map(|g| g.target_count).collect()
}

fn assert_counts_match(store: &StateStore, rollout_id: &str) {
    let rollout = store.get_rollout(rollout_id).unwrap().unwrap();
    let groups = store.list_groups(rollout_id).unwrap();
    assert_eq!(
        groups.iter().map(|g| g.target_count).sum::<u32>(),
        rollout.total_targets
    );
    for group in &groups {
        if group.state != GroupState::Scheduled && group.state != GroupState::Ready {
            assert_eq!(group.counts.total(), group.target_count, "group {}", group.id);
        }
    }
}

fn assert_ordered(groups: &[RolloutGroup]) {
    for pair in groups.windows(2) {
        let started = !matches!(pair[1].state, GroupState::Scheduled | GroupState::Ready);
        if started {
            assert!(
                pair[0].releases_successor(),
                "group {} started while group {} is {:?}",
                pair[1].index,
                pair[0].index,
                pair[0].state
            );
        }
    }
}

#[test]
fn percentage_groups_cover_every_target() {
    let store = test_store(100);
    let m = manager(&store);
    m.create(auto_rollout("tenths", GroupSpec::Percentages(vec![10, 20, 70])))
        .unwrap();
    assert_eq!(sizes(&m.groups("tenths").unwrap()), vec![10, 20, 70]);
    assert_counts_match(&store, "tenths");

    let store = test_store(9);
    let m = manager(&store);
    m.create(auto_rollout("odd", GroupSpec::Percentages(vec![10, 20, 70])))
        .unwrap();
    // floor(0.9) and floor(1.8); the final group takes the rest.
    assert_eq!(sizes(&m.groups("odd").unwrap()), vec![0, 1, 8]);
    assert_counts_match(&store, "odd");

    let store = test_store(100);
    let m = manager(&store);
    m.create(auto_rollout("thirds", GroupSpec::Percentages(vec![33, 33, 34])))
        .unwrap();
    assert_eq!(sizes(&m.groups("thirds").unwrap()), vec![33, 33, 34]);
    assert_eq!(m.get("thirds").unwrap().total_targets, 100);
}

#[test]
fn rollout_runs_to_completion_group_by_group() {
    let store = test_store(6);
    let m = manager(&store);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut s = scheduler(&store, "worker-1", dispatcher.clone());
    m.create(auto_rollout("fw", GroupSpec::Count(3))).unwrap();

    s.run_cycle_at(100);
    assert_eq!(m.get("fw").unwrap().state, RolloutState::Running);
    assert_eq!(dispatcher.dispatched().len(), 2);

    for (i, now) in [(0usize, 110u64), (1, 120), (2, 130)] {
        let groups = m.groups("fw").unwrap();
        assert_eq!(groups[i].state, GroupState::Running);
        assert_ordered(&groups);
        report_group(&store, &groups[i].id, ActionStatus::FinishedSuccess, usize::MAX, now);
        assert_counts_match(&store, "fw");
        s.run_cycle_at(now);
    }

    let rollout = m.get("fw").unwrap();
    assert_eq!(rollout.state, RolloutState::Finished);
    let groups = m.groups("fw").unwrap();
    assert!(groups.iter().all(|g| g.state == GroupState::Finished));
    assert!(groups.iter().all(|g| g.outcome == Some(GroupOutcome::Success)));
    assert_eq!(dispatcher.dispatched().len(), 6);
}

#[test]
fn full_threshold_waits_for_the_last_action() {
    let store = test_store(5);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    m.create(auto_rollout("all", GroupSpec::Count(1))).unwrap();
    s.run_cycle_at(100);
    let group_id = RolloutGroup::group_id("all", 0);

    report_group(&store, &group_id, ActionStatus::FinishedSuccess, 4, 101);
    s.run_cycle_at(101);
    assert_eq!(store.get_group(&group_id).unwrap().unwrap().state, GroupState::Running);
    assert_eq!(m.get("all").unwrap().state, RolloutState::Running);

    report_group(&store, &group_id, ActionStatus::FinishedSuccess, 1, 102);
    s.run_cycle_at(102);
    assert_eq!(store.get_group(&group_id).unwrap().unwrap().state, GroupState::Finished);
    assert_eq!(m.get("all").unwrap().state, RolloutState::Finished);
}

#[test]
fn error_condition_wins_over_success() {
    let store = test_store(4);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    let mut request = auto_rollout("risky", GroupSpec::Count(2));
    request.success_condition = Condition::Threshold(50);
    request.error_condition = Some(Condition::Count(1));
    m.create(request).unwrap();
    s.run_cycle_at(100);

    // Both conditions hold after these two reports.
    let first = RolloutGroup::group_id("risky", 0);
    report_group(&store, &first, ActionStatus::FinishedSuccess, 1, 101);
    report_group(&store, &first, ActionStatus::FinishedError, 1, 101);
    s.run_cycle_at(101);

    let rollout = m.get("risky").unwrap();
    assert_eq!(rollout.state, RolloutState::Paused);
    assert!(rollout.last_error.is_some());
    let groups = m.groups("risky").unwrap();
    assert_eq!(groups[0].state, GroupState::Error);
    assert_eq!(groups[1].state, GroupState::Scheduled);

    // Resuming acknowledges the failure and lets the next group start.
    m.resume("risky").unwrap();
    s.run_cycle_at(102);
    let groups = m.groups("risky").unwrap();
    assert_eq!(groups[1].state, GroupState::Running);
    assert_ordered(&groups);
}

#[test]
fn stop_error_action_moves_rollout_to_error() {
    let store = test_store(2);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    let mut request = auto_rollout("strict", GroupSpec::Count(2));
    request.error_condition = Some(Condition::Count(1));
    request.error_action = ErrorAction::Stop;
    m.create(request).unwrap();
    s.run_cycle_at(100);

    report_group(&store, "strict:0000", ActionStatus::FinishedError, 1, 101);
    s.run_cycle_at(101);
    assert_eq!(m.get("strict").unwrap().state, RolloutState::Error);
    assert_eq!(m.groups("strict").unwrap()[1].state, GroupState::Scheduled);
}

#[test]
fn pause_and_resume_do_not_reissue_actions() {
    let store = test_store(4);
    let m = manager(&store);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let mut s = scheduler(&store, "worker-1", dispatcher.clone());
    m.create(auto_rollout("calm", GroupSpec::Count(2))).unwrap();
    s.run_cycle_at(100);
    assert_eq!(dispatcher.dispatched().len(), 2);

    m.pause("calm").unwrap();
    report_group(&store, "calm:0000", ActionStatus::FinishedSuccess, usize::MAX, 101);
    s.run_cycle_at(101);
    assert_eq!(m.groups("calm").unwrap()[1].state, GroupState::Scheduled);

    m.resume("calm").unwrap();
    s.run_cycle_at(102);
    s.run_cycle_at(103);
    assert_eq!(dispatcher.dispatched().len(), 4);
    assert_eq!(m.actions("calm").unwrap().len(), 4);
    assert_counts_match(&store, "calm");
}

#[test]
fn trigger_next_group_skips_the_wait() {
    let store = test_store(4);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    m.create(auto_rollout("push", GroupSpec::Count(2))).unwrap();
    s.run_cycle_at(100);

    let triggered = m.trigger_next_group("push").unwrap();
    assert_eq!(triggered.outcome, Some(GroupOutcome::Triggered));
    s.run_cycle_at(101);
    assert_eq!(m.groups("push").unwrap()[1].state, GroupState::Running);
}

#[test]
fn deleted_rollout_is_reclaimed_by_cleanup() {
    let store = test_store(4);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    m.create(auto_rollout("gone", GroupSpec::Count(2))).unwrap();
    s.run_cycle_at(100);
    report_group(&store, "gone:0000", ActionStatus::Download, usize::MAX, 100);

    m.delete("gone").unwrap();
    s.run_cycle_at(101);
    s.run_cycle_at(102);
    // No new group starts and issued actions stay visible.
    assert_eq!(m.groups("gone").unwrap()[1].state, GroupState::Scheduled);
    assert_eq!(m.actions("gone").unwrap().len(), 2);

    let collector = CleanupCollector::new(
        store.clone(),
        Arc::new(InFlightGrace {
            grace: Duration::from_secs(60),
        }),
    );

    // Devices are still downloading: their actions and group are kept.
    let report = collector.run_once(120);
    assert_eq!(report.actions_retained, 2);
    assert_eq!(report.groups_deleted, 1);
    assert_eq!(report.rollouts_purged, 0);
    assert_eq!(m.get("gone").unwrap().state, RolloutState::Deleting);

    // Once they go quiet everything is reclaimed.
    let report = collector.run_once(1_000);
    assert_eq!(report.actions_deleted, 2);
    assert_eq!(report.groups_deleted, 1);
    assert_eq!(report.rollouts_purged, 1);
    let rollout = m.get("gone").unwrap();
    assert_eq!(rollout.state, RolloutState::Deleted);
    assert!(rollout.group_ids.is_empty());
    assert!(store.list_actions_for_rollout("gone").unwrap().is_empty());
    assert!(store.get_lease(&Lease::rollout_key("gone")).unwrap().is_none());

    assert!(collector.run_once(1_001).is_noop());
}

#[test]
fn stop_cancels_open_actions() {
    let store = test_store(4);
    let m = manager(&store);
    let mut s = scheduler(&store, "worker-1", Arc::new(NoopDispatcher));
    m.create(auto_rollout("halt", GroupSpec::Count(2))).unwrap();
    s.run_cycle_at(100);
    report_group(&store, "halt:0000", ActionStatus::FinishedSuccess, 1, 101);

    m.stop("halt").unwrap();
    let statuses: Vec<ActionStatus> = m.actions("halt").unwrap().iter().map(|a| a.status).collect();
    assert!(statuses.contains(&ActionStatus::FinishedSuccess));
    assert!(statuses.contains(&ActionStatus::Canceling));

    s.run_cycle_at(102);
    assert_eq!(m.get("halt").unwrap().state, RolloutState::Stopped);
    assert_eq!(m.groups("halt").unwrap()[1].state, GroupState::Scheduled);
    assert_counts_match(&store, "halt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_keep_group_order() {
    let store = test_store(40);
    let m = manager(&store);
    for name in ["alpha", "beta", "gamma"] {
        m.create(auto_rollout(name, GroupSpec::Count(4))).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for w in 0..4 {
        let mut s = scheduler(&store, &format!("worker-{w}"), Arc::new(NoopDispatcher));
        let done = done.clone();
        workers.push(tokio::spawn(async move {
            let mut tick = 0u64;
            while !done.load(Ordering::Acquire) && tick < 100_000 {
                s.run_cycle_at(100 + tick);
                tick += 1;
                tokio::task::yield_now().await;
            }
        }));
    }

    let reporter = {
        let store = store.clone();
        tokio::spawn(async move {
            for tick in 0..100_000u64 {
                let mut finished = 0;
                for name in ["alpha", "beta", "gamma"] {
                    let groups = store.list_groups(name).unwrap();
                    assert_ordered(&groups);
                    assert_counts_match(&store, name);
                    for group in groups.iter().filter(|g| g.state == GroupState::Running) {
                        report_group(&store, &group.id, ActionStatus::FinishedSuccess, 3, 100 + tick);
                    }
                    if store.get_rollout(name).unwrap().unwrap().state == RolloutState::Finished {
                        finished += 1;
                    }
                }
                if finished == 3 {
                    return true;
                }
                tokio::task::yield_now().await;
            }
            false
        })
    };

    let finished = reporter.await.unwrap();
    done.store(true, Ordering::Release);
    for worker in workers {
        worker.await.unwrap();
    }
    assert!(finished, "rollouts did not finish");
    for name in ["alpha", "beta", "gamma"] {
        assert_eq!(m.get(name).unwrap().state, RolloutState::Finished);
        assert_eq!(m.actions(name).unwrap().len(), 40);
    }
}
