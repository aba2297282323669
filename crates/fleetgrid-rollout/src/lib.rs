//! fleetgrid-rollout: staged rollouts with partitioning, group conditions,
//! status aggregation, and the rollout state machine.
//!
//! # Components
//!
//! - **`resolver`**: filter expression to target set (`TargetResolver`)
//! - **`partition`**: target set to ordered groups, quota checks
//! - **`aggregator`**: status report mailbox and per-group counters
//! - **`condition`**: success/error condition verdicts
//! - **`controller`**: rollout and group state machines
//! - **`executor`**: group start and progression, one rollout at a time
//! - **`manager`**: operator commands
//! - **`dispatcher`**: notification seam towards the device layer

pub mod aggregator;
pub mod condition;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod manager;
pub mod partition;
pub mod resolver;

pub use aggregator::{Aggregator, AggregatorHandle, StatusReport};
pub use condition::{Verdict, evaluate};
pub use controller::RolloutCommand;
pub use dispatcher::{ActionDispatcher, DispatchError, NoopDispatcher, RecordingDispatcher};
pub use error::{RolloutError, RolloutResult};
pub use executor::{Advance, GroupExecutor};
pub use manager::{CreateRollout, RolloutManager};
pub use partition::{GroupPlan, GroupSpec};
pub use resolver::{StoreTargetResolver, TargetResolver};
