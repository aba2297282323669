//! `fleetgridd run`: the long-running side of fleetgrid.
//!
//! In this mode, the daemon:
//! 1. Spawns `[scheduler].workers` scheduler loops, each with its own
//!    lease owner, all sharing the state store
//! 2. Runs the cleanup collector for deleted rollouts
//! 3. Runs the status aggregator mailbox
//! 4. Serves the control API on `[api].listen`; CLI commands and device
//!    reports reach the store through it while the daemon holds it open
//! 5. Stops everything on Ctrl-C through a shared shutdown channel

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_core::FleetConfig;
use fleetgrid_rollout::{ActionDispatcher, Aggregator, DispatchError, GroupExecutor, StoreTargetResolver};
use fleetgrid_scheduler::{CleanupCollector, InFlightGrace, LiveResolver, RolloutScheduler, StoreLock};
use fleetgrid_state::{Action, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::api::{self, ApiState};

/// Mailbox size of the status aggregator.
const REPORT_MAILBOX: usize = 1024;

/// Dispatcher for deployments without a push channel: devices learn about
/// new actions on their next poll, so dispatch only logs.
pub struct LogDispatcher;

impl ActionDispatcher for LogDispatcher {
    fn dispatch(&self, action: &Action) -> Result<(), DispatchError> {
        debug!(
            action = %action.id,
            target = %action.target_id,
            distribution = %action.distribution,
            "action ready for pickup"
        );
        Ok(())
    }
}

pub async fn run(store: StateStore, config: FleetConfig) -> anyhow::Result<()> {
    let workers = config.scheduler.workers.max(1);
    info!(workers, "fleetgrid daemon starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(LogDispatcher);
    let resolver = Arc::new(StoreTargetResolver::new(store.clone()));

    // ── Scheduler workers ────────────────────────────────────────
    let mut handles = Vec::new();
    for worker in 0..workers {
        let owner = format!("fleetgridd-{}-{worker}", std::process::id());
        let executor = GroupExecutor::new(store.clone(), dispatcher.clone());
        let lock = Arc::new(StoreLock::new(store.clone(), owner.clone(), config.scheduler.lock_ttl()));
        let live = LiveResolver::new(
            store.clone(),
            resolver.clone(),
            executor.clone(),
            config.quota,
            config.scheduler.live_resolve_interval(),
        );
        let mut scheduler = RolloutScheduler::new(store.clone(), executor, lock, config.scheduler.clone())
            .with_live_resolution(live);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            info!(%owner, "scheduler worker spawned");
            scheduler.run(shutdown).await;
        }));
    }

    // ── Cleanup collector ────────────────────────────────────────
    let collector = CleanupCollector::new(
        store.clone(),
        Arc::new(InFlightGrace {
            grace: Duration::from_secs(config.cleanup.in_flight_grace_secs),
        }),
    );
    let cleanup_interval = config.cleanup.interval();
    let cleanup_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        collector.run(cleanup_interval, cleanup_shutdown).await;
    }));

    // ── Status aggregator ────────────────────────────────────────
    let (reports, aggregator_handle) =
        Aggregator::new(store.clone()).spawn(REPORT_MAILBOX, shutdown_rx.clone());
    handles.push(aggregator_handle);

    // ── Control API ──────────────────────────────────────────────
    let api_addr = config.api.listen;
    let listener = tokio::net::TcpListener::bind(api_addr).await?;
    info!(%api_addr, "control API listening");
    let router = api::build_router(ApiState {
        store,
        config: Arc::new(config),
        reports,
    });
    let mut api_shutdown = shutdown_rx;
    handles.push(tokio::spawn(async move {
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "control API server error");
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("fleetgrid daemon stopped");
    Ok(())
}
