//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Child keys extend their parent's key with `:` so a prefix scan over
//! `{parent}:` yields every child in order.

use redb::TableDefinition;

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Groups keyed by `{rollout_id}:{index:04}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Actions keyed by `{rollout_id}:{index:04}:{target_id}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Registered targets keyed by `{target_id}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Saved target filters keyed by `{filter_id}`.
pub const FILTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("filters");

/// Scheduler leases keyed by lease key (e.g. `rollout/{rollout_id}`).
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
