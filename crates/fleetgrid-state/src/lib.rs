//! fleetgrid-state: embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for rollouts, groups, actions, the target registry,
//! saved filters, and scheduler leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{rollout_id}:{index}`, `{group_id}:{target_id}`) enable
//! prefix scans for a rollout's groups and a group's actions.
//!
//! Operations that must stay consistent with each other (an action's status
//! and its group's counters, a lease check and its grant) run inside a
//! single redb write transaction. redb serializes write transactions, which
//! makes each of them atomic with respect to every other writer.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{IssuedActions, StateStore};
pub use types::*;
