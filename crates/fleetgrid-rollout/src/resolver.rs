//! Target resolution: turns a filter expression into a set of target ids.

use std::collections::BTreeSet;

use fleetgrid_core::FilterQuery;
use fleetgrid_state::{StateStore, TargetId};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// Enumerates the targets matching a filter.
///
/// Implementations must be deterministic for a given target population.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, filter: &str) -> RolloutResult<BTreeSet<TargetId>>;
}

/// Resolves filters against the target registry in the state store.
///
/// A filter of the form `@<filter-id>` expands to the saved filter's query.
#[derive(Clone)]
pub struct StoreTargetResolver {
    store: StateStore,
}

impl StoreTargetResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn expand(&self, filter: &str) -> RolloutResult<String> {
        let Some(id) = filter.trim().strip_prefix('@') else {
            return Ok(filter.to_string());
        };
        let saved = self
            .store
            .get_filter(id)?
            .ok_or_else(|| RolloutError::InvalidFilter(format!("no saved filter '{id}'")))?;
        Ok(saved.query)
    }
}

impl TargetResolver for StoreTargetResolver {
    fn resolve(&self, filter: &str) -> RolloutResult<BTreeSet<TargetId>> {
        let source = self.expand(filter)?;
        let query =
            FilterQuery::parse(&source).map_err(|e| RolloutError::InvalidFilter(e.to_string()))?;

        let matched: BTreeSet<TargetId> = self
            .store
            .list_targets()?
            .into_iter()
            .filter(|t| query.matches(t))
            .map(|t| t.id)
            .collect();

        debug!(filter = %query, matched = matched.len(), "targets resolved");
        Ok(matched)
    }
}
