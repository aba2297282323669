//! Per-rollout mutual exclusion between scheduler workers.
//!
//! A worker must hold a rollout's lease before it changes group or
//! rollout state. Leases expire after a TTL, so a crashed worker blocks
//! a rollout for at most one TTL. Every grant to a new holder bumps a
//! fencing token; renew and release only succeed with the current token,
//! and writes made through [`LeaseGuard::fence`] only commit while the
//! token is still current.

use std::time::Duration;

use fleetgrid_core::epoch_millis;
use fleetgrid_state::{Fence, Lease, LeaseGrant, StateStore};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Proof of holding a rollout lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub rollout_id: String,
    pub key: String,
    pub owner: String,
    pub fencing: u64,
    pub expires_at_ms: u64,
}

impl LeaseGuard {
    /// The fence store writes must pass while this lease is in use.
    pub fn fence(&self) -> Fence {
        Fence {
            key: self.key.clone(),
            owner: self.owner.clone(),
            token: self.fencing,
        }
    }
}

pub trait RolloutLock: Send + Sync {
    /// Take the rollout's lease or fail with `LockContention`.
    fn acquire(&self, rollout_id: &str) -> SchedulerResult<LeaseGuard>;

    /// Extend a held lease. Returns false if it was lost to another worker.
    fn renew(&self, guard: &mut LeaseGuard) -> SchedulerResult<bool>;

    fn release(&self, guard: LeaseGuard) -> SchedulerResult<()>;
}

/// Leases kept in the state store's lease table.
#[derive(Clone)]
pub struct StoreLock {
    store: StateStore,
    owner: String,
    ttl: Duration,
}

impl StoreLock {
    pub fn new(store: StateStore, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }
}

impl RolloutLock for StoreLock {
    fn acquire(&self, rollout_id: &str) -> SchedulerResult<LeaseGuard> {
        let key = Lease::rollout_key(rollout_id);
        match self
            .store
            .try_acquire_lease(&key, &self.owner, epoch_millis(), self.ttl_ms())?
        {
            LeaseGrant::Granted(lease) => {
                debug!(rollout = %rollout_id, owner = %self.owner, fencing = lease.fencing, "lease acquired");
                Ok(LeaseGuard {
                    rollout_id: rollout_id.to_string(),
                    key,
                    owner: self.owner.clone(),
                    fencing: lease.fencing,
                    expires_at_ms: lease.expires_at_ms,
                })
            }
            LeaseGrant::Held(lease) => Err(SchedulerError::LockContention {
                rollout: rollout_id.to_string(),
                holder: lease.owner,
            }),
        }
    }

    fn renew(&self, guard: &mut LeaseGuard) -> SchedulerResult<bool> {
        let renewed = self.store.renew_lease(
            &guard.key,
            &self.owner,
            guard.fencing,
            epoch_millis(),
            self.ttl_ms(),
        )?;
        match renewed {
            Some(lease) => {
                guard.expires_at_ms = lease.expires_at_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release(&self, guard: LeaseGuard) -> SchedulerResult<()> {
        let released = self
            .store
            .release_lease(&guard.key, &self.owner, guard.fencing)?;
        if !released {
            debug!(rollout = %guard.rollout_id, "lease already lost");
        }
        Ok(())
    }
}
