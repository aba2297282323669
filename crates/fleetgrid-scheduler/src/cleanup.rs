//! Cleanup collector: reclaims the groups and actions of deleted rollouts.
//!
//! Only rollouts flagged deleted and in Deleting are touched. Each run
//! deletes what it can and leaves the rest for the next run, so a run
//! interrupted halfway is simply continued later. A rollout becomes
//! Deleted once none of its groups remain, and its lease row goes with it.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_core::epoch_secs;
use fleetgrid_rollout::controller::{self, RolloutCommand};
use fleetgrid_state::{Action, Rollout, RolloutState, StateStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;

/// Decides whether something outside the core still refers to an action.
pub trait ActionReferences: Send + Sync {
    fn is_referenced(&self, action: &Action, now: u64) -> bool;
}

/// Treats an unfinished action as in flight while its device reported
/// within the grace period.
pub struct InFlightGrace {
    pub grace: Duration,
}

impl ActionReferences for InFlightGrace {
    fn is_referenced(&self, action: &Action, now: u64) -> bool {
        !action.status.is_terminal()
            && now.saturating_sub(action.last_status_at) < self.grace.as_secs()
    }
}

/// Totals for one collector run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub rollouts_purged: u32,
    pub groups_deleted: u32,
    pub actions_deleted: u32,
    /// Actions kept because they are still referenced.
    pub actions_retained: u32,
    pub failed: u32,
}

impl CleanupReport {
    pub fn is_noop(&self) -> bool {
        self.rollouts_purged == 0 && self.groups_deleted == 0 && self.actions_deleted == 0
    }
}

pub struct CleanupCollector {
    store: StateStore,
    references: Arc<dyn ActionReferences>,
}

impl CleanupCollector {
    pub fn new(store: StateStore, references: Arc<dyn ActionReferences>) -> Self {
        Self { store, references }
    }

    /// Run the collector every `interval` until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "cleanup collector started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once(epoch_secs());
                    if !report.is_noop() {
                        info!(
                            purged = report.rollouts_purged,
                            groups = report.groups_deleted,
                            actions = report.actions_deleted,
                            retained = report.actions_retained,
                            "cleanup pass"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("cleanup collector shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over every deleted rollout.
    ///
    /// Failures are logged and counted; the rollout is retried next run.
    pub fn run_once(&self, now: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        let rollouts = match self.store.list_rollouts() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "cleanup could not list rollouts");
                report.failed += 1;
                return report;
            }
        };

        for rollout in rollouts
            .into_iter()
            .filter(|r| r.deleted && r.state == RolloutState::Deleting)
        {
            if let Err(e) = self.collect(rollout.clone(), now, &mut report) {
                warn!(rollout = %rollout.id, error = %e, "cleanup failed, retrying next run");
                report.failed += 1;
            }
        }
        report
    }

    fn collect(&self, mut rollout: Rollout, now: u64, report: &mut CleanupReport) -> SchedulerResult<()> {
        for group in self.store.list_groups(&rollout.id)? {
            let mut remaining = 0;
            for action in self.store.list_actions_for_group(&group.id)? {
                if self.references.is_referenced(&action, now) {
                    remaining += 1;
                    report.actions_retained += 1;
                    continue;
                }
                if self.store.delete_action(&action.id)? {
                    report.actions_deleted += 1;
                }
            }
            if remaining > 0 {
                debug!(rollout = %rollout.id, group = group.index, remaining, "group still referenced");
                continue;
            }
            if self.store.delete_group(&group.id)? {
                report.groups_deleted += 1;
            }
        }

        if self.store.list_groups(&rollout.id)?.is_empty() {
            controller::apply(&mut rollout, RolloutCommand::Purged, now)?;
            rollout.group_ids.clear();
            self.store.purge_rollout(&rollout)?;
            report.rollouts_purged += 1;
            info!(rollout = %rollout.id, "rollout purged");
        }
        Ok(())
    }
}
