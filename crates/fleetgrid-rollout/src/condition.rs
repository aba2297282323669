//! Group condition evaluation.
//!
//! A running group is evaluated against its aggregated status counts.
//! The error condition is checked before the success condition, so a
//! group that satisfies both in the same pass fails.

use fleetgrid_state::{Condition, RolloutGroup, StatusCounts};

/// Result of evaluating a running group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Neither condition met and actions are still outstanding.
    Pending,
    /// Success condition met.
    Succeeded,
    /// Every action terminal without meeting the success condition.
    Degraded,
    /// Error condition met.
    Failed,
}

/// Whether `count` out of `total` satisfies `condition`.
pub fn is_met(condition: Condition, count: u32, total: u32) -> bool {
    match condition {
        Condition::Threshold(pct) => count as u64 * 100 >= pct as u64 * total as u64,
        Condition::Count(required) => count >= required,
    }
}

pub fn evaluate(group: &RolloutGroup) -> Verdict {
    evaluate_counts(
        &group.counts,
        group.success_condition,
        group.error_condition,
    )
}

pub fn evaluate_counts(
    counts: &StatusCounts,
    success: Condition,
    error: Option<Condition>,
) -> Verdict {
    let total = counts.total();
    if total == 0 {
        return Verdict::Succeeded;
    }
    // An error condition needs at least one failed action; a threshold of
    // zero would otherwise fail every group on its first evaluation.
    if let Some(error) = error {
        if counts.error() > 0 && is_met(error, counts.error(), total) {
            return Verdict::Failed;
        }
    }
    if is_met(success, counts.success(), total) {
        return Verdict::Succeeded;
    }
    if counts.pending() == 0 {
        return Verdict::Degraded;
    }
    Verdict::Pending
}
