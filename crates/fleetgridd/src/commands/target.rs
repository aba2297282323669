use std::collections::BTreeMap;

use clap::Subcommand;
use fleetgrid_core::{FilterQuery, epoch_secs};
use fleetgrid_state::{StateStore, Target, TargetFilter};
use serde::{Deserialize, Serialize};

#[derive(Debug, Subcommand, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetAction {
    /// Register or update a device.
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// Repeatable.
        #[arg(long)]
        tag: Vec<String>,
        /// `key=value`, repeatable.
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },
    Remove { id: String },
    /// List registered devices, optionally narrowed by a filter.
    List {
        #[arg(long)]
        filter: Option<String>,
    },
}

#[derive(Debug, Subcommand, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Save a filter under an id so rollouts can use `@id`.
    Save {
        id: String,
        query: String,
        #[arg(long)]
        name: Option<String>,
    },
    Remove { id: String },
    List,
}

pub fn execute_target(store: &StateStore, action: TargetAction) -> anyhow::Result<String> {
    match action {
        TargetAction::Add {
            id,
            name,
            tag,
            attributes,
        } => {
            let existing = store.get_target(&id)?;
            let target = Target {
                name: name.unwrap_or_else(|| id.clone()),
                attributes: attributes.into_iter().collect::<BTreeMap<_, _>>(),
                tags: tag,
                registered_at: existing.as_ref().map_or_else(epoch_secs, |t| t.registered_at),
                last_poll_at: existing.and_then(|t| t.last_poll_at),
                id,
            };
            store.put_target(&target)?;
            Ok(format!("target {} registered", target.id))
        }
        TargetAction::Remove { id } => {
            if store.delete_target(&id)? {
                Ok(format!("target {id} removed"))
            } else {
                anyhow::bail!("target {id} not found")
            }
        }
        TargetAction::List { filter } => {
            let query = filter.as_deref().map(FilterQuery::parse).transpose()?;
            let lines: Vec<String> = store
                .list_targets()?
                .into_iter()
                .filter(|t| query.as_ref().is_none_or(|q| q.matches(t)))
                .map(|t| format!("{:<32} {:<24} {}", t.id, t.name, t.tags.join(",")))
                .collect();
            Ok(lines.join("\n"))
        }
    }
}

pub fn execute_filter(store: &StateStore, action: FilterAction) -> anyhow::Result<String> {
    match action {
        FilterAction::Save { id, query, name } => {
            FilterQuery::parse(&query)?;
            let filter = TargetFilter {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                query,
                created_at: epoch_secs(),
            };
            store.put_filter(&filter)?;
            Ok(format!("filter @{} saved", filter.id))
        }
        FilterAction::Remove { id } => {
            if store.delete_filter(&id)? {
                Ok(format!("filter @{id} removed"))
            } else {
                anyhow::bail!("filter @{id} not found")
            }
        }
        FilterAction::List => {
            let lines: Vec<String> = store
                .list_filters()?
                .into_iter()
                .map(|f| format!("@{:<24} {}", f.id, f.query))
                .collect();
            Ok(lines.join("\n"))
        }
    }
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("attribute '{raw}' must be key=value")),
    }
}
