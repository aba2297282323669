//! Action delivery seam.
//!
//! Devices poll for their assignments, so an issued action is already
//! visible once it is committed. A dispatcher only notifies the device
//! communication layer; a failed notification leaves the action pollable.

use std::sync::Mutex;

use fleetgrid_state::{Action, ActionId};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("dispatch of {action} failed: {reason}")]
pub struct DispatchError {
    pub action: ActionId,
    pub reason: String,
}

pub trait ActionDispatcher: Send + Sync {
    fn dispatch(&self, action: &Action) -> Result<(), DispatchError>;
}

/// Dispatcher for deployments where devices only poll.
pub struct NoopDispatcher;

impl ActionDispatcher for NoopDispatcher {
    fn dispatch(&self, _action: &Action) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Keeps the ids of every dispatched action, in order.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<ActionId>>,
}

impl RecordingDispatcher {
    pub fn dispatched(&self) -> Vec<ActionId> {
        self.dispatched
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

impl ActionDispatcher for RecordingDispatcher {
    fn dispatch(&self, action: &Action) -> Result<(), DispatchError> {
        let mut dispatched = self.dispatched.lock().map_err(|_| DispatchError {
            action: action.id.clone(),
            reason: "recorder poisoned".to_string(),
        })?;
        dispatched.push(action.id.clone());
        Ok(())
    }
}
