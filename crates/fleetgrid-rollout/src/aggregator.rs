//! Action status aggregator.
//!
//! Devices report action status asynchronously. Reports are sent through
//! an [`AggregatorHandle`] into a mailbox drained by a single aggregator
//! task, which applies them one at a time. Each report updates the action
//! and its group's [`StatusCounts`](fleetgrid_state::StatusCounts) in one
//! write transaction, so the scheduler always evaluates a committed
//! aggregate.

use fleetgrid_core::epoch_secs;
use fleetgrid_state::{ActionId, ActionStatus, ActionTransition, StateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};

/// A device's report of an action's new status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub action_id: ActionId,
    pub status: ActionStatus,
    pub reported_at: u64,
}

impl StatusReport {
    pub fn now(action_id: impl Into<ActionId>, status: ActionStatus) -> Self {
        Self {
            action_id: action_id.into(),
            status,
            reported_at: epoch_secs(),
        }
    }
}

/// Sending side of the aggregator mailbox.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<StatusReport>,
}

impl AggregatorHandle {
    pub async fn report(&self, report: StatusReport) -> RolloutResult<()> {
        self.tx
            .send(report)
            .await
            .map_err(|_| RolloutError::MailboxClosed)
    }
}

#[derive(Clone)]
pub struct Aggregator {
    store: StateStore,
}

impl Aggregator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Apply one report synchronously.
    ///
    /// Reports for unknown actions and for actions that are already
    /// terminal are ignored.
    pub fn apply(&self, report: &StatusReport) -> RolloutResult<ActionTransition> {
        let transition =
            self.store
                .transition_action(&report.action_id, report.status, report.reported_at)?;
        match &transition {
            ActionTransition::Applied { action, from } => debug!(
                action = %action.id,
                %from,
                to = %action.status,
                "action status updated"
            ),
            ActionTransition::Unchanged(action) => {
                debug!(action = %action.id, status = %action.status, "duplicate status report");
            }
            ActionTransition::Rejected(action) => warn!(
                action = %action.id,
                current = %action.status,
                reported = %report.status,
                "ignoring report for terminal action"
            ),
            ActionTransition::NotFound => {
                warn!(action = %report.action_id, "ignoring report for unknown action");
            }
        }
        Ok(transition)
    }

    /// Spawn the aggregator task with a mailbox of `capacity` reports.
    pub fn spawn(
        self,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(rx, shutdown));
        (AggregatorHandle { tx }, handle)
    }

    /// Apply reports until every handle is dropped or shutdown is
    /// signalled. Reports already queued at shutdown are still applied.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<StatusReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("status aggregator started");
        loop {
            tokio::select! {
                report = rx.recv() => match report {
                    Some(report) => self.apply_logged(&report),
                    None => break,
                },
                _ = shutdown.changed() => {
                    rx.close();
                    while let Some(report) = rx.recv().await {
                        self.apply_logged(&report);
                    }
                    break;
                }
            }
        }
        info!("status aggregator stopped");
    }

    fn apply_logged(&self, report: &StatusReport) {
        // The device repeats its report on its next poll.
        if let Err(e) = self.apply(report) {
            warn!(action = %report.action_id, error = %e, "status report dropped");
        }
    }
}
