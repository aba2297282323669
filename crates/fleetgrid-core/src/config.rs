//! fleetgrid.toml configuration parser.
//!
//! Every section is optional; missing sections and keys fall back to the
//! defaults below so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Group ids carry a four-digit index, so listing a rollout's groups by
/// key only returns them in order below this many groups.
pub const GROUP_INDEX_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub quota: QuotaConfig,
    pub scheduler: SchedulerConfig,
    pub cleanup: CleanupConfig,
    pub rollout: RolloutDefaults,
    pub api: ApiConfig,
}

/// The daemon's local control API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address `fleetgridd run` listens on, and the CLI connects to while
    /// the daemon holds the store.
    pub listen: SocketAddr,
    /// Seconds the CLI waits for the daemon to answer.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7480)),
            timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `fleetgrid.redb`.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

/// Upper bounds enforced when a rollout is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_groups_per_rollout: u32,
    pub max_actions_per_group: u32,
    pub max_actions_per_rollout: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_groups_per_rollout: 500,
            max_actions_per_group: 5_000,
            max_actions_per_rollout: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler cycles.
    pub interval_secs: u64,
    /// Lifetime of a rollout lease. Must exceed the time one cycle holds it.
    pub lock_ttl_secs: u64,
    /// Consecutive transient failures tolerated before a rollout goes to Error.
    pub max_retries: u32,
    /// Cap for the exponential retry backoff.
    pub backoff_max_secs: u64,
    /// Seconds between re-resolutions of live rollouts.
    pub live_resolve_interval_secs: u64,
    /// Scheduler workers spawned by the daemon.
    pub workers: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            lock_ttl_secs: 30,
            max_retries: 5,
            backoff_max_secs: 300,
            live_resolve_interval_secs: 60,
            workers: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn live_resolve_interval(&self) -> Duration {
        Duration::from_secs(self.live_resolve_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    /// Non-terminal actions reported within this window count as in flight
    /// and are kept until the device goes quiet.
    pub in_flight_grace_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            in_flight_grace_secs: 300,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutDefaults {
    /// New rollouts wait in WaitingForApproval until an operator approves.
    pub approval_required: bool,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the redb database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join("fleetgrid.redb")
    }

    fn validate(&self) -> anyhow::Result<()> {
        let q = &self.quota;
        if q.max_groups_per_rollout == 0 {
            anyhow::bail!("quota.max_groups_per_rollout must be at least 1");
        }
        if q.max_groups_per_rollout > GROUP_INDEX_LIMIT {
            anyhow::bail!(
                "quota.max_groups_per_rollout ({}) exceeds the limit of {GROUP_INDEX_LIMIT}",
                q.max_groups_per_rollout
            );
        }
        if q.max_actions_per_group > q.max_actions_per_rollout {
            anyhow::bail!(
                "quota.max_actions_per_group ({}) exceeds quota.max_actions_per_rollout ({})",
                q.max_actions_per_group,
                q.max_actions_per_rollout
            );
        }
        if self.scheduler.lock_ttl_secs <= self.scheduler.interval_secs / 2 {
            // A lease shorter than half a cycle tends to lapse mid-transition.
            anyhow::bail!("scheduler.lock_ttl_secs is too short for scheduler.interval_secs");
        }
        Ok(())
    }
}
