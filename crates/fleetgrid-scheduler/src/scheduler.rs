//! RolloutScheduler: the group progression loop.
//!
//! Every cycle the scheduler lists the rollouts it may act on (Ready with
//! a due start policy, Starting, Running), highest weight first, and for
//! each one:
//!
//! 1. skips it while it is backing off after transient failures;
//! 2. takes the rollout's lease, counting contention and moving on;
//! 3. advances it through [`GroupExecutor::advance`], which re-reads the
//!    rollout under the lease and ignores deleted rollouts;
//! 4. re-resolves live rollouts when due;
//! 5. releases the lease.
//!
//! Transient failures back off exponentially from the cycle interval up
//! to `backoff_max`. After `max_retries` consecutive failures the rollout
//! is moved to Error.
//!
//! Any number of schedulers may run against the same store; the lease
//! keeps them from working on the same rollout at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_core::{SchedulerConfig, epoch_secs};
use fleetgrid_rollout::controller::{self, RolloutCommand};
use fleetgrid_rollout::executor::is_due;
use fleetgrid_rollout::{GroupExecutor, RolloutError};
use fleetgrid_state::{Rollout, RolloutId, RolloutState, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lease::{LeaseGuard, RolloutLock};
use crate::live::LiveResolver;

/// What one scheduler cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Rollouts whose state or groups changed.
    pub advanced: u32,
    /// Rollouts locked by another worker.
    pub contended: u32,
    pub failed: u32,
    /// Rollouts still backing off.
    pub skipped: u32,
}

/// Consecutive failures of one rollout.
#[derive(Debug, Clone, Copy)]
struct Retry {
    failures: u32,
    not_before: u64,
}

pub struct RolloutScheduler {
    store: StateStore,
    executor: GroupExecutor,
    lock: Arc<dyn RolloutLock>,
    live: Option<LiveResolver>,
    config: SchedulerConfig,
    retries: HashMap<RolloutId, Retry>,
}

impl RolloutScheduler {
    pub fn new(
        store: StateStore,
        executor: GroupExecutor,
        lock: Arc<dyn RolloutLock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            lock,
            live: None,
            config,
            retries: HashMap::new(),
        }
    }

    /// Re-resolve live rollouts as part of each cycle.
    pub fn with_live_resolution(mut self, live: LiveResolver) -> Self {
        self.live = Some(live);
        self
    }

    /// Run cycles every `scheduler.interval_secs` until shutdown.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(interval_secs = interval.as_secs(), "rollout scheduler started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle();
                    if report != CycleReport::default() {
                        debug!(
                            advanced = report.advanced,
                            contended = report.contended,
                            failed = report.failed,
                            skipped = report.skipped,
                            "scheduler cycle"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(epoch_secs())
    }

    /// One pass over every schedulable rollout, as of `now` (unix seconds).
    pub fn run_cycle_at(&mut self, now: u64) -> CycleReport {
        let mut report = CycleReport::default();
        let candidates = match self.candidates(now) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not list rollouts");
                report.failed += 1;
                return report;
            }
        };

        for id in candidates {
            if self.retries.get(&id).is_some_and(|r| now < r.not_before) {
                report.skipped += 1;
                continue;
            }

            match self.step(&id, now) {
                Ok(progressed) => {
                    self.retries.remove(&id);
                    if progressed {
                        report.advanced += 1;
                    }
                }
                Err(SchedulerError::LockContention { holder, .. }) => {
                    debug!(rollout = %id, %holder, "rollout locked by another worker");
                    report.contended += 1;
                }
                Err(e) if e.is_lease_lost() => {
                    warn!(rollout = %id, error = %e, "lease lost mid-cycle, nothing committed");
                    report.contended += 1;
                }
                Err(e) if e.is_transient() => {
                    report.failed += 1;
                    self.record_failure(&id, now, &e);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(rollout = %id, error = %e, "rollout step failed");
                }
            }
        }
        report
    }

    /// Rollouts this cycle may act on, highest weight first, then by id.
    fn candidates(&self, now: u64) -> SchedulerResult<Vec<RolloutId>> {
        let mut rollouts: Vec<Rollout> = self
            .store
            .list_rollouts()?
            .into_iter()
            .filter(|r| {
                !r.deleted
                    && r.state.is_schedulable()
                    && (r.state != RolloutState::Ready || is_due(&r.start_policy, now))
            })
            .collect();
        rollouts.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
        Ok(rollouts.into_iter().map(|r| r.id).collect())
    }

    fn step(&self, id: &str, now: u64) -> SchedulerResult<bool> {
        let mut guard = self.lock.acquire(id)?;
        let result = self.step_locked(id, &mut guard, now);
        if let Err(e) = self.lock.release(guard) {
            warn!(rollout = %id, error = %e, "lease release failed, leaving it to expire");
        }
        result
    }

    fn step_locked(&self, id: &str, guard: &mut LeaseGuard, now: u64) -> SchedulerResult<bool> {
        let advance = self.executor.fenced(guard.fence()).advance(id, now)?;
        let mut progressed = advance.progressed();

        if let Some(live) = &self.live {
            if !self.lock.renew(guard)? {
                warn!(rollout = %id, "lease lost mid-cycle");
                return Ok(progressed);
            }
            if live.fenced(guard.fence()).refresh(id, now)? > 0 {
                progressed = true;
            }
        }
        Ok(progressed)
    }

    fn record_failure(&mut self, id: &str, now: u64, err: &SchedulerError) {
        let retry = self.retries.entry(id.to_string()).or_insert(Retry {
            failures: 0,
            not_before: 0,
        });
        retry.failures += 1;
        let failures = retry.failures;

        if failures >= self.config.max_retries {
            self.retries.remove(id);
            error!(rollout = %id, failures, error = %err, "retries exhausted");
            if let Err(e) = self.give_up(id, now, err) {
                warn!(rollout = %id, error = %e, "could not move rollout to error");
            }
            return;
        }

        let delay = backoff(self.config.interval(), self.config.backoff_max(), failures);
        retry.not_before = now + delay.as_secs();
        warn!(
            rollout = %id,
            failures,
            retry_in_secs = delay.as_secs(),
            error = %err,
            "rollout step failed, backing off"
        );
    }

    fn give_up(&self, id: &str, now: u64, err: &SchedulerError) -> SchedulerResult<()> {
        let guard = self.lock.acquire(id)?;
        let store = self.store.fenced(guard.fence());
        let result = (|| -> SchedulerResult<()> {
            let mut rollout = store
                .get_rollout(id)?
                .ok_or_else(|| RolloutError::NotFound(format!("rollout {id}")))?;
            controller::apply(&mut rollout, RolloutCommand::RetriesExhausted, now)?;
            rollout.last_error = Some(format!("gave up after repeated failures: {err}"));
            store.put_rollout(&rollout)?;
            Ok(())
        })();
        self.lock.release(guard)?;
        result
    }
}

/// Exponential backoff: `base × 2^(failures-1)`, capped at `max`.
pub fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use fleetgrid_core::{FleetConfig, QuotaConfig};
    use fleetgrid_rollout::{
        CreateRollout, GroupSpec, NoopDispatcher, RolloutManager, RolloutResult,
        StoreTargetResolver, TargetResolver,
    };
    use fleetgrid_state::{Lease, ResolveMode, StartPolicy, StateError, Target, TargetId};

    use crate::lease::StoreLock;

    struct Fixture {
        store: StateStore,
        manager: RolloutManager,
    }

    fn fixture(targets: usize) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..targets {
            store
                .put_target(&Target {
                    id: format!("dev-{i:02}"),
                    name: format!("dev {i}"),
                    attributes: BTreeMap::new(),
                    tags: vec![],
                    registered_at: 0,
                    last_poll_at: None,
                })
                .unwrap();
        }
        let resolver = Arc::new(StoreTargetResolver::new(store.clone()));
        let manager = RolloutManager::new(store.clone(), resolver, &FleetConfig::default());
        Fixture { store, manager }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval_secs: 1,
            backoff_max_secs: 4,
            max_retries: 3,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(store: &StateStore, worker: &str) -> RolloutScheduler {
        let executor = GroupExecutor::new(store.clone(), Arc::new(NoopDispatcher));
        let lock = Arc::new(StoreLock::new(store.clone(), worker, Duration::from_secs(30)));
        RolloutScheduler::new(store.clone(), executor, lock, config())
    }

    fn auto(name: &str, weight: u32) -> CreateRollout {
        let mut req = CreateRollout::new(name, "id==dev-*", "fw", GroupSpec::Count(2));
        req.start_policy = StartPolicy::Auto;
        req.weight = weight;
        req
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(10));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(20));
        assert_eq!(backoff(base, max, 3), Duration::from_secs(40));
        assert_eq!(backoff(base, max, 4), max);
        assert_eq!(backoff(base, max, 200), max);
    }

    #[test]
    fn candidates_by_weight_then_id() {
        let f = fixture(4);
        f.manager.create(auto("b-low", 1)).unwrap();
        f.manager.create(auto("a-low", 1)).unwrap();
        f.manager.create(auto("high", 9)).unwrap();
        // Manual start policy: never picked up while Ready.
        f.manager
            .create(CreateRollout::new("manual", "id==dev-*", "fw", GroupSpec::Count(1)))
            .unwrap();

        let s = scheduler(&f.store, "w1");
        assert_eq!(s.candidates(0).unwrap(), vec!["high", "a-low", "b-low"]);
    }

    #[test]
    fn cycle_starts_due_rollouts() {
        let f = fixture(4);
        f.manager.create(auto("fw", 0)).unwrap();
        let mut s = scheduler(&f.store, "w1");

        let report = s.run_cycle_at(100);
        assert_eq!(report.advanced, 1);
        assert_eq!(f.manager.get("fw").unwrap().state, RolloutState::Running);

        // Nothing to do until devices report.
        assert_eq!(s.run_cycle_at(101), CycleReport::default());
    }

    #[test]
    fn contention_is_counted_not_failed() {
        let f = fixture(4);
        f.manager.create(auto("fw", 0)).unwrap();
        f.store
            .try_acquire_lease(&Lease::rollout_key("fw"), "w2", fleetgrid_core::epoch_millis(), 60_000)
            .unwrap();

        let report = scheduler(&f.store, "w1").run_cycle_at(100);
        assert_eq!(report.contended, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.manager.get("fw").unwrap().state, RolloutState::Ready);
    }

    #[test]
    fn deleted_rollouts_are_left_alone() {
        let f = fixture(4);
        f.manager.create(auto("fw", 0)).unwrap();
        let mut s = scheduler(&f.store, "w1");
        s.run_cycle_at(100);
        f.manager.delete("fw").unwrap();

        assert_eq!(s.run_cycle_at(101), CycleReport::default());
        let groups = f.manager.groups("fw").unwrap();
        assert_eq!(groups[1].state, fleetgrid_state::GroupState::Scheduled);
    }

    /// Hands out guards for a lease it never took, as a worker would
    /// after its lease expired and was granted to someone else.
    struct StaleLock;

    impl RolloutLock for StaleLock {
        fn acquire(&self, rollout_id: &str) -> SchedulerResult<LeaseGuard> {
            Ok(LeaseGuard {
                rollout_id: rollout_id.to_string(),
                key: Lease::rollout_key(rollout_id),
                owner: "w-stale".to_string(),
                fencing: 7,
                expires_at_ms: u64::MAX,
            })
        }

        fn renew(&self, _guard: &mut LeaseGuard) -> SchedulerResult<bool> {
            Ok(true)
        }

        fn release(&self, _guard: LeaseGuard) -> SchedulerResult<()> {
            Ok(())
        }
    }

    #[test]
    fn stale_lease_commits_nothing() {
        let f = fixture(4);
        f.manager.create(auto("fw", 0)).unwrap();
        let executor = GroupExecutor::new(f.store.clone(), Arc::new(NoopDispatcher));
        let mut s = RolloutScheduler::new(f.store.clone(), executor, Arc::new(StaleLock), config());

        let report = s.run_cycle_at(100);
        assert_eq!(report.contended, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.manager.get("fw").unwrap().state, RolloutState::Ready);
        assert!(f.manager.actions("fw").unwrap().is_empty());
    }

    struct BrokenResolver;

    impl TargetResolver for BrokenResolver {
        fn resolve(&self, _filter: &str) -> RolloutResult<BTreeSet<TargetId>> {
            Err(RolloutError::Persistence(StateError::Read("registry offline".into())))
        }
    }

    #[test]
    fn transient_failures_back_off_then_give_up() {
        let f = fixture(4);
        let mut req = auto("fw", 0);
        req.resolve_mode = ResolveMode::Live;
        f.manager.create(req).unwrap();
        let mut rollout = f.manager.get("fw").unwrap();
        rollout.last_resolved_at = 0;
        f.store.put_rollout(&rollout).unwrap();

        let executor = GroupExecutor::new(f.store.clone(), Arc::new(NoopDispatcher));
        let live = LiveResolver::new(
            f.store.clone(),
            Arc::new(BrokenResolver),
            executor,
            QuotaConfig::default(),
            Duration::from_secs(1),
        );
        let mut s = scheduler(&f.store, "w1").with_live_resolution(live);

        assert_eq!(s.run_cycle_at(100).failed, 1);
        assert_eq!(s.run_cycle_at(100).skipped, 1);
        // base 1s, second failure waits 2s.
        assert_eq!(s.run_cycle_at(101).failed, 1);
        assert_eq!(s.run_cycle_at(102).skipped, 1);
        assert_eq!(s.run_cycle_at(103).failed, 1);

        let rollout = f.manager.get("fw").unwrap();
        assert_eq!(rollout.state, RolloutState::Error);
        assert!(rollout.last_error.unwrap().contains("registry offline"));
        // Lease released after giving up.
        assert!(
            f.store
                .get_lease(&Lease::rollout_key("fw"))
                .unwrap()
                .unwrap()
                .is_expired(fleetgrid_core::epoch_millis())
        );
    }
}
