//! Domain types for the fleetgrid state store.
//!
//! These types represent the persisted state of rollouts, their groups
//! and actions, the target registry, saved filters, and scheduler leases.
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use fleetgrid_core::Targetable;
use serde::{Deserialize, Serialize};

/// Rollout identifier (the operator-chosen rollout name).
pub type RolloutId = String;

/// `{rollout_id}:{index:04}`.
pub type GroupId = String;

/// `{group_id}:{target_id}`.
pub type ActionId = String;

/// Device identifier, owned by the device registry.
pub type TargetId = String;

// ── Rollout ────────────────────────────────────────────────────────

/// A staged deployment campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    /// Filter expression the targets were resolved from.
    pub target_filter: String,
    /// Distribution artifact every action installs.
    pub distribution: String,
    /// Group ids in progression order.
    pub group_ids: Vec<GroupId>,
    /// Number of targets across all groups.
    pub total_targets: u32,
    pub state: RolloutState,
    /// Error action applied to groups created without an explicit one.
    pub error_action: ErrorAction,
    pub start_policy: StartPolicy,
    pub resolve_mode: ResolveMode,
    pub action_type: ActionType,
    /// Higher weight rollouts are scheduled first.
    pub weight: u32,
    pub deleted: bool,
    /// Why the rollout was paused or moved to Error.
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Last live re-resolution (unix seconds), 0 if never.
    #[serde(default)]
    pub last_resolved_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Creating,
    WaitingForApproval,
    ApprovalDenied,
    Ready,
    Starting,
    Running,
    Paused,
    Stopped,
    Finished,
    Error,
    Deleting,
    Deleted,
}

impl RolloutState {
    /// No further progression happens from these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ApprovalDenied
                | Self::Stopped
                | Self::Finished
                | Self::Error
                | Self::Deleting
                | Self::Deleted
        )
    }

    /// States the scheduler loop acts on.
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Ready | Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::ApprovalDenied => "approval_denied",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// What happens to the rollout when a group meets its error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartPolicy {
    /// Waits for an explicit operator start.
    #[default]
    Manual,
    /// Started by the scheduler once `start_at` (unix seconds) has passed.
    Scheduled { start_at: u64 },
    /// Started by the scheduler as soon as it is ready.
    Auto,
}

/// How the target set is bound to the rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Resolved once at creation.
    #[default]
    Snapshot,
    /// Re-resolved while running; new matches join the final group.
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Forced,
    Soft,
    DownloadOnly,
}

// ── Group ──────────────────────────────────────────────────────────

/// Success/error criterion for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// Percentage of the group's actions (0-100).
    Threshold(u8),
    /// Absolute number of actions.
    Count(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Scheduled,
    Ready,
    Running,
    Finished,
    Error,
}

impl GroupState {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// How a finished group got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOutcome {
    /// Success condition met.
    Success,
    /// Every action terminal without meeting the success condition.
    Degraded,
    /// Finished by an operator trigger-next-group command.
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    /// Position in the progression order (0-based).
    pub index: u32,
    pub name: String,
    pub targets: Vec<TargetId>,
    pub target_count: u32,
    pub success_condition: Condition,
    pub error_condition: Option<Condition>,
    pub error_action: ErrorAction,
    pub state: GroupState,
    pub outcome: Option<GroupOutcome>,
    pub counts: StatusCounts,
    /// Set when an operator resumes the rollout after this group failed.
    pub error_acknowledged: bool,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl RolloutGroup {
    pub fn group_id(rollout_id: &str, index: u32) -> GroupId {
        format!("{rollout_id}:{index:04}")
    }

    /// Whether the group after this one may start.
    pub fn releases_successor(&self) -> bool {
        match self.state {
            GroupState::Finished => true,
            GroupState::Error => self.error_acknowledged,
            _ => false,
        }
    }
}

// ── Action ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Created,
    Running,
    Download,
    Canceling,
    Canceled,
    FinishedSuccess,
    FinishedError,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::FinishedSuccess | Self::FinishedError
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Download => "download",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::FinishedSuccess => "finished_success",
            Self::FinishedError => "finished_error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "download" => Ok(Self::Download),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            "finished_success" | "success" => Ok(Self::FinishedSuccess),
            "finished_error" | "error" => Ok(Self::FinishedError),
            other => Err(format!("unknown action status '{other}'")),
        }
    }
}

/// Deployment of the rollout's distribution to one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub distribution: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub weight: u32,
    pub created_at: u64,
    /// Unix timestamp of the last status report.
    pub last_status_at: u64,
}

impl Action {
    pub fn action_id(group_id: &str, target_id: &str) -> ActionId {
        format!("{group_id}:{target_id}")
    }
}

/// Per-status action counters of one group.
///
/// Each action contributes to exactly one counter, so the sum of the
/// counters is the number of actions in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub created: u32,
    pub running: u32,
    pub download: u32,
    pub canceling: u32,
    pub canceled: u32,
    pub finished_success: u32,
    pub finished_error: u32,
}

impl StatusCounts {
    fn slot(&mut self, status: ActionStatus) -> &mut u32 {
        match status {
            ActionStatus::Created => &mut self.created,
            ActionStatus::Running => &mut self.running,
            ActionStatus::Download => &mut self.download,
            ActionStatus::Canceling => &mut self.canceling,
            ActionStatus::Canceled => &mut self.canceled,
            ActionStatus::FinishedSuccess => &mut self.finished_success,
            ActionStatus::FinishedError => &mut self.finished_error,
        }
    }

    pub fn get(&self, status: ActionStatus) -> u32 {
        match status {
            ActionStatus::Created => self.created,
            ActionStatus::Running => self.running,
            ActionStatus::Download => self.download,
            ActionStatus::Canceling => self.canceling,
            ActionStatus::Canceled => self.canceled,
            ActionStatus::FinishedSuccess => self.finished_success,
            ActionStatus::FinishedError => self.finished_error,
        }
    }

    /// Count a newly created action.
    pub fn increment(&mut self, status: ActionStatus) {
        *self.slot(status) += 1;
    }

    /// Remove an action (cleanup).
    pub fn decrement(&mut self, status: ActionStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }

    /// Move one action from `from` to `to`.
    pub fn record_transition(&mut self, from: ActionStatus, to: ActionStatus) {
        if from != to {
            self.decrement(from);
            self.increment(to);
        }
    }

    pub fn total(&self) -> u32 {
        self.created
            + self.running
            + self.download
            + self.canceling
            + self.canceled
            + self.finished_success
            + self.finished_error
    }

    pub fn success(&self) -> u32 {
        self.finished_success
    }

    pub fn error(&self) -> u32 {
        self.finished_error
    }

    /// Actions still waiting on a device.
    pub fn pending(&self) -> u32 {
        self.created + self.running + self.download + self.canceling
    }

    pub fn terminal(&self) -> u32 {
        self.canceled + self.finished_success + self.finished_error
    }

    pub fn success_ratio(&self) -> f64 {
        ratio(self.finished_success, self.total())
    }

    pub fn error_ratio(&self) -> f64 {
        ratio(self.finished_error, self.total())
    }
}

fn ratio(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

// ── Targets ────────────────────────────────────────────────────────

/// A registered device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub registered_at: u64,
    pub last_poll_at: Option<u64>,
}

impl Targetable for Target {
    fn target_id(&self) -> &str {
        &self.id
    }

    fn target_name(&self) -> &str {
        &self.name
    }

    fn has_tag(&self, pred: &dyn Fn(&str) -> bool) -> bool {
        self.tags.iter().any(|t| pred(t))
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A saved filter expression, referenced from rollouts as `@{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetFilter {
    pub id: String,
    pub name: String,
    pub query: String,
    pub created_at: u64,
}

// ── Leases ─────────────────────────────────────────────────────────

/// Exclusive, expiring ownership of a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Incremented on every grant to a new holder.
    pub fencing: u64,
    pub expires_at_ms: u64,
}

impl Lease {
    /// Key of the lease guarding a rollout's state.
    pub fn rollout_key(rollout_id: &str) -> String {
        format!("rollout/{rollout_id}")
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// The lease a fenced writer must still hold when it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub key: String,
    pub owner: String,
    pub token: u64,
}

impl Fence {
    /// Whether `lease` is still this fence's grant at `now_ms`.
    pub fn admits(&self, lease: &Lease, now_ms: u64) -> bool {
        lease.owner == self.owner && lease.fencing == self.token && !lease.is_expired(now_ms)
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Granted(Lease),
    /// Someone else holds an unexpired lease.
    Held(Lease),
}

/// Result of applying a status report to an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTransition {
    Applied {
        action: Action,
        from: ActionStatus,
    },
    /// The action already had this status.
    Unchanged(Action),
    /// Terminal actions accept no further transitions.
    Rejected(Action),
    NotFound,
}
