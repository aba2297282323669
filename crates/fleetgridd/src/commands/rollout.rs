use std::sync::Arc;

use clap::Subcommand;
use fleetgrid_core::FleetConfig;
use fleetgrid_rollout::{CreateRollout, GroupSpec, RolloutManager, StoreTargetResolver};
use fleetgrid_state::{Condition, ResolveMode, Rollout, StartPolicy, StateStore};
use serde::{Deserialize, Serialize};

use super::parse_keyword;

#[derive(Debug, Subcommand, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutAction {
    /// Resolve the filter, split targets into groups and store the rollout.
    Create {
        /// Rollout name, also its id.
        name: String,
        /// Target filter, e.g. `tag==beta;attribute.hw==rev2*` or `@saved-filter`.
        #[arg(long)]
        filter: String,
        /// Distribution every device installs.
        #[arg(long)]
        distribution: String,
        /// Group percentages, e.g. 10,20,70.
        #[arg(long, value_delimiter = ',', conflicts_with_all = ["group_count", "group"])]
        groups: Vec<u32>,
        /// Number of equally sized groups.
        #[arg(long, conflicts_with = "group")]
        group_count: Option<u32>,
        /// Explicit group as comma-separated target ids. Repeat per group.
        #[arg(long)]
        group: Vec<String>,
        /// `threshold:<percent>` or `count:<n>`.
        #[arg(long, default_value = "threshold:100")]
        success: String,
        /// `threshold:<percent>` or `count:<n>`.
        #[arg(long)]
        error: Option<String>,
        /// pause or stop.
        #[arg(long, default_value = "pause")]
        error_action: String,
        /// manual, auto, or the unix time to start at.
        #[arg(long, default_value = "manual")]
        start: String,
        /// Add newly matching targets while the rollout runs.
        #[arg(long)]
        live: bool,
        /// forced, soft or download-only.
        #[arg(long, default_value = "forced")]
        action_type: String,
        #[arg(long, default_value = "0")]
        weight: u32,
        #[arg(long)]
        description: Option<String>,
        /// Wait for approval regardless of [rollout].approval_required.
        #[arg(long)]
        require_approval: bool,
    },
    Approve { name: String },
    Deny { name: String },
    /// Hand a ready rollout to the scheduler.
    Start { name: String },
    Pause { name: String },
    /// Resume a paused rollout, acknowledging a failed group.
    Resume { name: String },
    /// Stop the rollout and cancel unfinished actions.
    Stop { name: String },
    /// Mark the rollout deleted; cleanup reclaims it later.
    Delete { name: String },
    /// Finish the running group now.
    TriggerNext { name: String },
    List,
    /// Print a rollout with its groups as JSON.
    Show { name: String },
}

pub fn execute(store: &StateStore, config: &FleetConfig, action: RolloutAction) -> anyhow::Result<String> {
    let resolver = Arc::new(StoreTargetResolver::new(store.clone()));
    let manager = RolloutManager::new(store.clone(), resolver, config);

    let rollout = match action {
        RolloutAction::Create {
            name,
            filter,
            distribution,
            groups,
            group_count,
            group,
            success,
            error,
            error_action,
            start,
            live,
            action_type,
            weight,
            description,
            require_approval,
        } => {
            let spec = group_spec(groups, group_count, group)?;
            let mut request = CreateRollout::new(&name, &filter, &distribution, spec);
            request.description = description;
            request.success_condition = parse_condition(&success)?;
            request.error_condition = error.as_deref().map(parse_condition).transpose()?;
            request.error_action = parse_keyword("error action", &error_action)?;
            request.start_policy = parse_start(&start)?;
            if live {
                request.resolve_mode = ResolveMode::Live;
            }
            request.action_type = parse_keyword("action type", &action_type)?;
            request.weight = weight;
            if require_approval {
                request.approval_required = Some(true);
            }
            let rollout = manager.create(request)?;
            return Ok(serde_json::to_string_pretty(&rollout)?);
        }
        RolloutAction::Approve { name } => manager.approve(&name)?,
        RolloutAction::Deny { name } => manager.deny(&name)?,
        RolloutAction::Start { name } => manager.start(&name)?,
        RolloutAction::Pause { name } => manager.pause(&name)?,
        RolloutAction::Resume { name } => manager.resume(&name)?,
        RolloutAction::Stop { name } => manager.stop(&name)?,
        RolloutAction::Delete { name } => manager.delete(&name)?,
        RolloutAction::TriggerNext { name } => {
            let group = manager.trigger_next_group(&name)?;
            return Ok(format!("rollout {name}: group {} ({}) finished", group.index, group.name));
        }
        RolloutAction::List => return Ok(format_list(&manager.list()?)),
        RolloutAction::Show { name } => {
            let rollout = manager.get(&name)?;
            let groups = manager.groups(&name)?;
            let doc = serde_json::json!({ "rollout": rollout, "groups": groups });
            return Ok(serde_json::to_string_pretty(&doc)?);
        }
    };
    Ok(format!("rollout {} is {}", rollout.id, rollout.state))
}

fn group_spec(percentages: Vec<u32>, count: Option<u32>, explicit: Vec<String>) -> anyhow::Result<GroupSpec> {
    if !explicit.is_empty() {
        let subsets = explicit
            .iter()
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .collect();
        return Ok(GroupSpec::Explicit(subsets));
    }
    if let Some(count) = count {
        return Ok(GroupSpec::Count(count));
    }
    if percentages.is_empty() {
        anyhow::bail!("one of --groups, --group-count or --group is required");
    }
    Ok(GroupSpec::Percentages(percentages))
}

/// `threshold:<percent>` or `count:<n>`.
pub(crate) fn parse_condition(value: &str) -> anyhow::Result<Condition> {
    let Some((kind, amount)) = value.split_once(':') else {
        anyhow::bail!("condition '{value}' must look like threshold:<percent> or count:<n>");
    };
    match kind.trim() {
        "threshold" => {
            let pct: u8 = amount.trim().parse()?;
            if pct > 100 {
                anyhow::bail!("threshold {pct} is above 100");
            }
            Ok(Condition::Threshold(pct))
        }
        "count" => Ok(Condition::Count(amount.trim().parse()?)),
        other => anyhow::bail!("unknown condition kind '{other}'"),
    }
}

fn parse_start(value: &str) -> anyhow::Result<StartPolicy> {
    match value {
        "manual" => Ok(StartPolicy::Manual),
        "auto" => Ok(StartPolicy::Auto),
        at => match at.parse() {
            Ok(start_at) => Ok(StartPolicy::Scheduled { start_at }),
            Err(_) => anyhow::bail!("start '{at}' must be manual, auto or a unix time"),
        },
    }
}

fn format_list(rollouts: &[Rollout]) -> String {
    let mut out = format!("{:<32} {:<20} {:>8} {:>6}", "NAME", "STATE", "TARGETS", "WEIGHT");
    for r in rollouts {
        let state = if r.deleted && r.state != fleetgrid_state::RolloutState::Deleted {
            format!("{} (deleted)", r.state)
        } else {
            r.state.to_string()
        };
        out.push_str(&format!(
            "\n{:<32} {:<20} {:>8} {:>6}",
            r.id, state, r.total_targets, r.weight
        ));
    }
    out
}
