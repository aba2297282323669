//! fleetgrid-scheduler: the background side of fleetgrid.
//!
//! - [`RolloutScheduler`] advances rollouts group by group, with retries
//!   and exponential backoff on transient failures
//! - [`StoreLock`] keeps two workers off the same rollout
//! - [`LiveResolver`] grows live rollouts as new targets match
//! - [`CleanupCollector`] reclaims what deleted rollouts leave behind
//!
//! # Architecture
//!
//! ```text
//! RolloutScheduler (N workers)
//!   ├── RolloutLock (lease per rollout, fencing token)
//!   ├── GroupExecutor (start, evaluate, settle groups)
//!   └── LiveResolver (optional, live rollouts only)
//!
//! CleanupCollector
//!   └── ActionReferences (in-flight grace)
//! ```

pub mod cleanup;
pub mod error;
pub mod lease;
pub mod live;
pub mod scheduler;

pub use cleanup::{ActionReferences, CleanupCollector, CleanupReport, InFlightGrace};
pub use error::{SchedulerError, SchedulerResult};
pub use lease::{LeaseGuard, RolloutLock, StoreLock};
pub use live::LiveResolver;
pub use scheduler::{CycleReport, RolloutScheduler, backoff};
