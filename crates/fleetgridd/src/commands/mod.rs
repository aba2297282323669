pub mod action;
pub mod rollout;
pub mod target;

use fleetgrid_core::FleetConfig;
use fleetgrid_state::StateStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use action::DeviceAction;
use rollout::RolloutAction;
use target::{FilterAction, TargetAction};

/// A store command, either run in-process or forwarded to the daemon's
/// control API as JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command", content = "action")]
pub enum Request {
    Rollout(RolloutAction),
    Target(TargetAction),
    Filter(FilterAction),
    Action(DeviceAction),
    Cleanup,
}

impl Request {
    pub fn execute(self, store: &StateStore, config: &FleetConfig) -> anyhow::Result<String> {
        match self {
            Request::Rollout(action) => rollout::execute(store, config, action),
            Request::Target(action) => target::execute_target(store, action),
            Request::Filter(action) => target::execute_filter(store, action),
            Request::Action(action) => action::execute(store, action),
            Request::Cleanup => action::cleanup(store, config),
        }
    }
}

/// Parse a kebab- or snake-case keyword into one of the store's enums.
pub(crate) fn parse_keyword<T: DeserializeOwned>(what: &str, value: &str) -> anyhow::Result<T> {
    let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|_| anyhow::anyhow!("unknown {what} '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{ActionStatus, ActionType, ErrorAction};

    #[test]
    fn keywords_accept_kebab_case() {
        let t: ActionType = parse_keyword("action type", "download-only").unwrap();
        assert_eq!(t, ActionType::DownloadOnly);
        let s: ActionStatus = parse_keyword("status", "finished_success").unwrap();
        assert_eq!(s, ActionStatus::FinishedSuccess);
        let a: ErrorAction = parse_keyword("error action", "STOP").unwrap();
        assert_eq!(a, ErrorAction::Stop);
    }

    #[test]
    fn requests_travel_as_tagged_json() {
        let request = Request::Rollout(RolloutAction::Start { name: "fw".into() });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"], "rollout");
        assert_eq!(json["action"]["start"]["name"], "fw");

        let cleanup: Request = serde_json::from_str(r#"{"command":"cleanup"}"#).unwrap();
        assert!(matches!(cleanup, Request::Cleanup));
    }

    #[test]
    fn requests_run_against_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        let out = Request::Filter(FilterAction::Save {
            id: "beta".into(),
            query: "tag==beta".into(),
            name: None,
        })
        .execute(&store, &FleetConfig::default())
        .unwrap();
        assert_eq!(out, "filter @beta saved");
        assert!(store.get_filter("beta").unwrap().is_some());
    }

    #[test]
    fn unknown_keyword_names_the_field() {
        let err = parse_keyword::<ErrorAction>("error action", "explode").unwrap_err();
        assert_eq!(err.to_string(), "unknown error action 'explode'");
    }
}
