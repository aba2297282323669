use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use fleetgrid_core::{FleetConfig, epoch_secs};
use fleetgrid_rollout::{Aggregator, StatusReport};
use fleetgrid_scheduler::{CleanupCollector, InFlightGrace};
use fleetgrid_state::{ActionStatus, ActionTransition, StateStore};
use serde::{Deserialize, Serialize};

use super::parse_keyword;

#[derive(Debug, Subcommand, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    /// Report an action's status, as the device would on check-in.
    Report {
        /// `{rollout}:{group}:{target}`.
        action_id: String,
        /// running, download, canceled, finished-success or finished-error.
        status: String,
    },
    /// List the actions addressed to a device.
    Poll { target: String },
}

pub fn execute(store: &StateStore, action: DeviceAction) -> anyhow::Result<String> {
    match action {
        DeviceAction::Report { action_id, status } => {
            let status: ActionStatus = parse_keyword("action status", &status)?;
            let aggregator = Aggregator::new(store.clone());
            let report = StatusReport::now(action_id, status);
            let message = match aggregator.apply(&report)? {
                ActionTransition::Applied { action, from } => {
                    format!("action {}: {from} -> {}", action.id, action.status)
                }
                ActionTransition::Unchanged(action) => {
                    format!("action {} already {}", action.id, action.status)
                }
                ActionTransition::Rejected(action) => {
                    anyhow::bail!("action {} is already {}", action.id, action.status)
                }
                ActionTransition::NotFound => anyhow::bail!("action {} not found", report.action_id),
            };
            Ok(message)
        }
        DeviceAction::Poll { target } => {
            let lines: Vec<String> = store
                .list_actions_for_target(&target)?
                .into_iter()
                .filter(|a| !a.status.is_terminal())
                .map(|a| format!("{:<48} {:<12} {}", a.id, a.status, a.distribution))
                .collect();
            Ok(lines.join("\n"))
        }
    }
}

/// One collector pass, as the daemon runs it periodically.
pub fn cleanup(store: &StateStore, config: &FleetConfig) -> anyhow::Result<String> {
    let collector = CleanupCollector::new(
        store.clone(),
        Arc::new(InFlightGrace {
            grace: Duration::from_secs(config.cleanup.in_flight_grace_secs),
        }),
    );
    let report = collector.run_once(epoch_secs());
    if report.failed > 0 {
        anyhow::bail!("cleanup failed for {} rollout(s), see log", report.failed);
    }
    Ok(format!(
        "purged {} rollout(s), deleted {} group(s) and {} action(s), kept {} in-flight action(s)",
        report.rollouts_purged, report.groups_deleted, report.actions_deleted, report.actions_retained
    ))
}
