//! Group partitioner: splits a resolved target set into ordered groups.
//!
//! Three ways to define groups are supported:
//!
//! - **Percentages**: group `i` receives `floor(total × pct[i] / 100)`
//!   targets and the final group receives whatever is left, so the sizes
//!   always sum to the total.
//! - **Count**: `K` equal groups, the final group absorbs the remainder.
//! - **Explicit**: caller-supplied disjoint subsets that together cover
//!   the resolved set exactly.
//!
//! Targets are assigned in sorted id order, which keeps partitioning
//! deterministic for a given target population.

use std::collections::{BTreeSet, HashSet};

use fleetgrid_core::{GROUP_INDEX_LIMIT, QuotaConfig};
use fleetgrid_state::TargetId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// How a rollout's targets are split into groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSpec {
    /// Per-group percentage weights, summing to 100.
    Percentages(Vec<u32>),
    /// A number of equally sized groups.
    Count(u32),
    /// Explicit target subsets, in progression order.
    Explicit(Vec<Vec<TargetId>>),
}

/// The targets of one group, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub targets: Vec<TargetId>,
}

impl GroupPlan {
    pub fn size(&self) -> u32 {
        self.targets.len() as u32
    }
}

/// Split `targets` into ordered groups according to `spec`.
pub fn partition(
    targets: &BTreeSet<TargetId>,
    spec: &GroupSpec,
    quota: &QuotaConfig,
) -> RolloutResult<Vec<GroupPlan>> {
    let plans = match spec {
        GroupSpec::Percentages(weights) => {
            check_group_count(weights.len(), quota)?;
            if weights.contains(&0) {
                return Err(RolloutError::InvalidGroupDefinition(
                    "group percentages must be positive".to_string(),
                ));
            }
            let sum: u32 = weights.iter().sum();
            if sum != 100 {
                return Err(RolloutError::InvalidGroupDefinition(format!(
                    "group percentages sum to {sum}, expected 100"
                )));
            }
            let total = targets.len() as u64;
            let sizes: Vec<usize> = weights
                .iter()
                .map(|&pct| (total * pct as u64 / 100) as usize)
                .collect();
            split_sizes(targets, &sizes)
        }
        GroupSpec::Count(k) => {
            check_group_count(*k as usize, quota)?;
            let each = targets.len() / *k as usize;
            split_sizes(targets, &vec![each; *k as usize])
        }
        GroupSpec::Explicit(subsets) => {
            check_group_count(subsets.len(), quota)?;
            explicit(targets, subsets)?
        }
    };

    check_quota(&plans, quota)?;
    debug!(
        targets = targets.len(),
        groups = plans.len(),
        "targets partitioned"
    );
    Ok(plans)
}

/// Check that a group may grow by `added` targets.
pub fn check_growth(
    group_size: u32,
    rollout_total: u32,
    added: u32,
    quota: &QuotaConfig,
) -> RolloutResult<()> {
    if group_size + added > quota.max_actions_per_group {
        return Err(RolloutError::QuotaExceeded(format!(
            "group would hold {} actions, limit is {}",
            group_size + added,
            quota.max_actions_per_group
        )));
    }
    if rollout_total + added > quota.max_actions_per_rollout {
        return Err(RolloutError::QuotaExceeded(format!(
            "rollout would hold {} actions, limit is {}",
            rollout_total + added,
            quota.max_actions_per_rollout
        )));
    }
    Ok(())
}

fn check_group_count(count: usize, quota: &QuotaConfig) -> RolloutResult<()> {
    if count == 0 {
        return Err(RolloutError::InvalidGroupDefinition(
            "at least one group is required".to_string(),
        ));
    }
    let limit = quota.max_groups_per_rollout.min(GROUP_INDEX_LIMIT);
    if count > limit as usize {
        return Err(RolloutError::InvalidGroupDefinition(format!(
            "{count} groups exceed the limit of {limit}"
        )));
    }
    Ok(())
}

fn check_quota(plans: &[GroupPlan], quota: &QuotaConfig) -> RolloutResult<()> {
    for (index, plan) in plans.iter().enumerate() {
        if plan.size() > quota.max_actions_per_group {
            return Err(RolloutError::QuotaExceeded(format!(
                "group {index} holds {} actions, limit is {}",
                plan.size(),
                quota.max_actions_per_group
            )));
        }
    }
    let total: u64 = plans.iter().map(|p| p.size() as u64).sum();
    if total > quota.max_actions_per_rollout as u64 {
        return Err(RolloutError::QuotaExceeded(format!(
            "rollout holds {total} actions, limit is {}",
            quota.max_actions_per_rollout
        )));
    }
    Ok(())
}

/// Fill groups in order with the given sizes; the last group takes the rest.
fn split_sizes(targets: &BTreeSet<TargetId>, sizes: &[usize]) -> Vec<GroupPlan> {
    let mut iter = targets.iter().cloned();
    let last = sizes.len().saturating_sub(1);
    sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let targets = if i == last {
                iter.by_ref().collect()
            } else {
                iter.by_ref().take(size).collect()
            };
            GroupPlan { targets }
        })
        .collect()
}

fn explicit(
    resolved: &BTreeSet<TargetId>,
    subsets: &[Vec<TargetId>],
) -> RolloutResult<Vec<GroupPlan>> {
    let mut seen = HashSet::new();
    let mut plans = Vec::with_capacity(subsets.len());
    for (index, subset) in subsets.iter().enumerate() {
        for target in subset {
            if !resolved.contains(target) {
                return Err(RolloutError::InvalidGroupDefinition(format!(
                    "group {index}: target '{target}' does not match the rollout filter"
                )));
            }
            if !seen.insert(target.as_str()) {
                return Err(RolloutError::InvalidGroupDefinition(format!(
                    "group {index}: target '{target}' is already in an earlier group"
                )));
            }
        }
        plans.push(GroupPlan {
            targets: subset.clone(),
        });
    }
    if seen.len() != resolved.len() {
        let missing: Vec<&str> = resolved
            .iter()
            .map(String::as_str)
            .filter(|t| !seen.contains(t))
            .take(5)
            .collect();
        return Err(RolloutError::InvalidGroupDefinition(format!(
            "{} resolved targets are in no group (e.g. {})",
            resolved.len() - seen.len(),
            missing.join(", ")
        )));
    }
    Ok(plans)
}
