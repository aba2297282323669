//! fleetgrid-core: configuration, target filter parsing, and clock
//! helpers shared by every fleetgrid crate.

pub mod config;
pub mod filter;
pub mod time;

pub use config::{
    ApiConfig, CleanupConfig, FleetConfig, GROUP_INDEX_LIMIT, QuotaConfig, RolloutDefaults,
    SchedulerConfig, StoreConfig,
};
pub use filter::{FilterError, FilterExpr, FilterQuery, Targetable};
pub use time::{epoch_millis, epoch_secs};
