//! StateStore: redb-backed state persistence for fleetgrid.
//!
//! Provides typed CRUD operations over rollouts, groups, actions, targets,
//! saved filters, and leases, plus the handful of multi-record operations
//! that have to commit atomically. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! A store obtained through [`StateStore::fenced`] checks, inside every
//! write transaction, that its lease is still held with the same fencing
//! token. A writer whose lease expired or was taken over therefore cannot
//! commit anything, even if it is still working through a cycle.

use std::path::Path;
use std::sync::Arc;

use fleetgrid_core::epoch_millis;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Actions created by [`StateStore::issue_actions`].
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedActions {
    /// The group after the actions were added.
    pub group: RolloutGroup,
    /// Actions that did not exist before this call.
    pub created: Vec<Action>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    fence: Option<Arc<Fence>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// redb locks the file for the lifetime of the database, so a second
    /// process opening the same path gets [`StateError::Locked`].
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StateError::Locked(path.display().to_string()),
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self {
            db: Arc::new(db),
            fence: None,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            fence: None,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            for def in [ROLLOUTS, GROUPS, ACTIONS, TARGETS, FILTERS, LEASES] {
                txn.open_table(def).map_err(map_err!(Table))?;
            }
            Ok(())
        })
    }

    /// A handle on the same database whose writes only commit while
    /// `fence` is the current, unexpired grant of its lease.
    pub fn fenced(&self, fence: Fence) -> Self {
        Self {
            db: self.db.clone(),
            fence: Some(Arc::new(fence)),
        }
    }

    /// Run `f` inside a write transaction, committing if it succeeds.
    ///
    /// Returning an error drops the transaction, which aborts it.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Some(fence) = &self.fence {
            check_fence(&txn, fence)?;
        }
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn read(&self) -> StateResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout together with its groups.
    ///
    /// Fails with `Conflict` if a rollout with the same id exists.
    pub fn create_rollout(&self, rollout: &Rollout, groups: &[RolloutGroup]) -> StateResult<()> {
        self.write(|txn| {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            if rollouts
                .get(rollout.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!("rollout {}", rollout.id)));
            }
            put_in(&mut rollouts, &rollout.id, rollout)?;

            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            for group in groups {
                put_in(&mut table, &group.id, group)?;
            }
            Ok(())
        })?;
        debug!(rollout = %rollout.id, groups = groups.len(), "rollout created");
        Ok(())
    }

    /// Insert or update a rollout.
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_in(&mut table, &rollout.id, rollout)
        })
    }

    /// Update a rollout and some of its groups in one transaction.
    pub fn put_rollout_with_groups(
        &self,
        rollout: &Rollout,
        groups: &[&RolloutGroup],
    ) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_in(&mut table, &rollout.id, rollout)?;
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            for group in groups {
                put_group_in(&mut table, group)?;
            }
            Ok(())
        })
    }

    pub fn get_rollout(&self, id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.read()?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_in(&table, id)
    }

    /// List all rollouts, ordered by id.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.read()?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        scan_prefix(&table, "")
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a group's progression state.
    ///
    /// Status counts and membership of an existing group are kept as
    /// stored; only the action paths and target appends change them.
    pub fn put_group(&self, group: &RolloutGroup) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            put_group_in(&mut table, group)
        })
    }

    pub fn get_group(&self, id: &str) -> StateResult<Option<RolloutGroup>> {
        let txn = self.read()?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        get_in(&table, id)
    }

    /// List a rollout's groups in progression order.
    pub fn list_groups(&self, rollout_id: &str) -> StateResult<Vec<RolloutGroup>> {
        let prefix = format!("{rollout_id}:");
        let txn = self.read()?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        scan_prefix(&table, &prefix)
    }

    /// Delete a group by id. Returns true if it existed.
    pub fn delete_group(&self, id: &str) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })?;
        debug!(group = %id, existed, "group deleted");
        Ok(existed)
    }

    /// Add targets to a group, keeping the rollout's total in step.
    ///
    /// Targets already in the group are skipped. Returns the updated
    /// rollout and group.
    pub fn append_group_targets(
        &self,
        group_id: &str,
        targets: &[TargetId],
    ) -> StateResult<(Rollout, RolloutGroup)> {
        self.write(|txn| {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut group: RolloutGroup = get_in(&groups, group_id)?
                .ok_or_else(|| StateError::NotFound(format!("group {group_id}")))?;
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, &group.rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {}", group.rollout_id)))?;

            let mut added = 0u32;
            for target in targets {
                if !group.targets.contains(target) {
                    group.targets.push(target.clone());
                    added += 1;
                }
            }
            group.target_count += added;
            rollout.total_targets += added;

            put_in(&mut groups, &group.id, &group)?;
            put_in(&mut rollouts, &rollout.id, &rollout)?;
            Ok((rollout, group))
        })
    }

    // ── Actions ────────────────────────────────────────────────────

    pub fn get_action(&self, id: &str) -> StateResult<Option<Action>> {
        let txn = self.read()?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_in(&table, id)
    }

    pub fn list_actions_for_group(&self, group_id: &str) -> StateResult<Vec<Action>> {
        let prefix = format!("{group_id}:");
        let txn = self.read()?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        scan_prefix(&table, &prefix)
    }

    pub fn list_actions_for_rollout(&self, rollout_id: &str) -> StateResult<Vec<Action>> {
        let prefix = format!("{rollout_id}:");
        let txn = self.read()?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        scan_prefix(&table, &prefix)
    }

    /// Actions assigned to one target across all rollouts (full scan).
    pub fn list_actions_for_target(&self, target_id: &str) -> StateResult<Vec<Action>> {
        let txn = self.read()?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let all: Vec<Action> = scan_prefix(&table, "")?;
        Ok(all.into_iter().filter(|a| a.target_id == target_id).collect())
    }

    /// Add actions to a group and mark it Running.
    ///
    /// Actions whose id already exists are left untouched, so issuing the
    /// same set twice creates nothing the second time. The group's status
    /// counters are updated in the same transaction.
    pub fn issue_actions(
        &self,
        group_id: &str,
        actions: &[Action],
        now: u64,
    ) -> StateResult<IssuedActions> {
        self.write(|txn| {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut group: RolloutGroup = get_in(&groups, group_id)?
                .ok_or_else(|| StateError::NotFound(format!("group {group_id}")))?;

            let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let mut created = Vec::new();
            for action in actions {
                let exists = table
                    .get(action.id.as_str())
                    .map_err(map_err!(Read))?
                    .is_some();
                if exists {
                    continue;
                }
                put_in(&mut table, &action.id, action)?;
                group.counts.increment(action.status);
                created.push(action.clone());
            }

            if matches!(group.state, GroupState::Scheduled | GroupState::Ready) {
                group.state = GroupState::Running;
                group.started_at = Some(now);
            }
            put_in(&mut groups, &group.id, &group)?;
            Ok(IssuedActions { group, created })
        })
    }

    /// Apply a status report to an action and its group's counters.
    pub fn transition_action(
        &self,
        action_id: &str,
        to: ActionStatus,
        now: u64,
    ) -> StateResult<ActionTransition> {
        self.write(|txn| {
            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let Some(mut action) = get_in::<Action>(&actions, action_id)? else {
                return Ok(ActionTransition::NotFound);
            };
            if action.status == to {
                return Ok(ActionTransition::Unchanged(action));
            }
            if action.status.is_terminal() {
                return Ok(ActionTransition::Rejected(action));
            }

            let from = action.status;
            action.status = to;
            action.last_status_at = now;
            put_in(&mut actions, &action.id, &action)?;

            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            if let Some(mut group) = get_in::<RolloutGroup>(&groups, &action.group_id)? {
                group.counts.record_transition(from, to);
                put_in(&mut groups, &group.id, &group)?;
            }
            Ok(ActionTransition::Applied { action, from })
        })
    }

    /// Move every non-terminal action of a rollout to Canceling.
    ///
    /// Returns the number of actions changed.
    pub fn cancel_open_actions(&self, rollout_id: &str, now: u64) -> StateResult<u32> {
        let changed = self.write(|txn| cancel_open_in(txn, rollout_id, now))?;
        debug!(rollout = %rollout_id, changed, "open actions canceling");
        Ok(changed)
    }

    /// Store a stopped rollout and cancel its open actions together.
    ///
    /// Either both happen or neither does, so a failed stop leaves the
    /// rollout in its previous state and can be repeated.
    pub fn stop_rollout(&self, rollout: &Rollout, now: u64) -> StateResult<u32> {
        let changed = self.write(|txn| {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_in(&mut table, &rollout.id, rollout)?;
            drop(table);
            cancel_open_in(txn, &rollout.id, now)
        })?;
        debug!(rollout = %rollout.id, changed, "rollout stopped, open actions canceling");
        Ok(changed)
    }

    /// Store a purged rollout and drop its lease row.
    pub fn purge_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            put_in(&mut table, &rollout.id, rollout)?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            leases
                .remove(Lease::rollout_key(&rollout.id).as_str())
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Delete an action and drop it from its group's counters.
    /// Returns true if it existed.
    pub fn delete_action(&self, id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let removed = actions
                .remove(id)
                .map_err(map_err!(Write))?
                .map(|guard| decode::<Action>(guard.value()))
                .transpose()?;
            let Some(action) = removed else {
                return Ok(false);
            };

            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            if let Some(mut group) = get_in::<RolloutGroup>(&groups, &action.group_id)? {
                group.counts.decrement(action.status);
                put_in(&mut groups, &group.id, &group)?;
            }
            Ok(true)
        })
    }

    // ── Targets ────────────────────────────────────────────────────

    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            put_in(&mut table, &target.id, target)
        })
    }

    pub fn get_target(&self, id: &str) -> StateResult<Option<Target>> {
        let txn = self.read()?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        get_in(&table, id)
    }

    pub fn list_targets(&self) -> StateResult<Vec<Target>> {
        let txn = self.read()?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        scan_prefix(&table, "")
    }

    pub fn delete_target(&self, id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }

    // ── Filters ────────────────────────────────────────────────────

    pub fn put_filter(&self, filter: &TargetFilter) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(FILTERS).map_err(map_err!(Table))?;
            put_in(&mut table, &filter.id, filter)
        })
    }

    pub fn get_filter(&self, id: &str) -> StateResult<Option<TargetFilter>> {
        let txn = self.read()?;
        let table = txn.open_table(FILTERS).map_err(map_err!(Table))?;
        get_in(&table, id)
    }

    pub fn list_filters(&self) -> StateResult<Vec<TargetFilter>> {
        let txn = self.read()?;
        let table = txn.open_table(FILTERS).map_err(map_err!(Table))?;
        scan_prefix(&table, "")
    }

    pub fn delete_filter(&self, id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(FILTERS).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant `key` to `owner` unless someone else holds an unexpired lease.
    ///
    /// Re-acquiring a lease the owner already holds extends it and keeps
    /// its fencing token; any other grant bumps the token. Released and
    /// expired leases stay in the table so tokens never repeat.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StateResult<LeaseGrant> {
        self.write(|txn| {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = get_in(&table, key)?;

            let fencing = match &current {
                Some(l) if !l.is_expired(now_ms) && l.owner != owner => {
                    return Ok(LeaseGrant::Held(l.clone()));
                }
                Some(l) if !l.is_expired(now_ms) => l.fencing,
                Some(l) => l.fencing + 1,
                None => 1,
            };

            let lease = Lease {
                key: key.to_string(),
                owner: owner.to_string(),
                fencing,
                expires_at_ms: now_ms + ttl_ms,
            };
            put_in(&mut table, key, &lease)?;
            Ok(LeaseGrant::Granted(lease))
        })
    }

    /// Extend a lease the caller still holds. Returns `None` if it was lost.
    pub fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        fencing: u64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StateResult<Option<Lease>> {
        self.write(|txn| {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match get_in::<Lease>(&table, key)? {
                Some(mut l) if l.owner == owner && l.fencing == fencing && !l.is_expired(now_ms) => {
                    l.expires_at_ms = now_ms + ttl_ms;
                    put_in(&mut table, key, &l)?;
                    Ok(Some(l))
                }
                _ => Ok(None),
            }
        })
    }

    /// Give up a lease. Returns false if the caller no longer held it.
    pub fn release_lease(&self, key: &str, owner: &str, fencing: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match get_in::<Lease>(&table, key)? {
                Some(mut l) if l.owner == owner && l.fencing == fencing => {
                    l.expires_at_ms = 0;
                    put_in(&mut table, key, &l)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    pub fn get_lease(&self, key: &str) -> StateResult<Option<Lease>> {
        let txn = self.read()?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        get_in(&table, key)
    }
}

// ── Table helpers ──────────────────────────────────────────────────

fn check_fence(txn: &WriteTransaction, fence: &Fence) -> StateResult<()> {
    let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
    match get_in::<Lease>(&table, &fence.key)? {
        Some(lease) if fence.admits(&lease, epoch_millis()) => Ok(()),
        Some(lease) => Err(StateError::Fenced(format!(
            "{} (token {}, now held by {} with token {})",
            fence.key, fence.token, lease.owner, lease.fencing
        ))),
        None => Err(StateError::Fenced(format!("{} has no lease", fence.key))),
    }
}

fn cancel_open_in(txn: &WriteTransaction, rollout_id: &str, now: u64) -> StateResult<u32> {
    let prefix = format!("{rollout_id}:");
    let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
    let open: Vec<Action> = scan_prefix::<Action>(&actions, &prefix)?
        .into_iter()
        .filter(|a| !a.status.is_terminal() && a.status != ActionStatus::Canceling)
        .collect();

    let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
    for mut action in open.iter().cloned() {
        let from = action.status;
        action.status = ActionStatus::Canceling;
        action.last_status_at = now;
        put_in(&mut actions, &action.id, &action)?;

        if let Some(mut group) = get_in::<RolloutGroup>(&groups, &action.group_id)? {
            group.counts.record_transition(from, ActionStatus::Canceling);
            put_in(&mut groups, &group.id, &group)?;
        }
    }
    Ok(open.len() as u32)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_in<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn put_in<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn put_group_in(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    group: &RolloutGroup,
) -> StateResult<()> {
    let stored: Option<RolloutGroup> = get_in(&*table, &group.id)?;
    match stored {
        Some(stored) => {
            let merged = RolloutGroup {
                counts: stored.counts,
                targets: stored.targets,
                target_count: stored.target_count,
                ..group.clone()
            };
            put_in(table, &group.id, &merged)
        }
        None => put_in(table, &group.id, group),
    }
}

/// Decode every value whose key starts with `prefix`, in key order.
fn scan_prefix<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(decode(value.value())?);
    }
    Ok(results)
}
