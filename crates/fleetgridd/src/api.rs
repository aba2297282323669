//! Control API served by `fleetgridd run`.
//!
//! The daemon holds the state store open, so every other process reaches
//! it through here: the CLI forwards its commands, and devices report
//! action status and poll for work.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/commands` | Run a CLI command against the daemon's store |
//! | POST | `/api/v1/actions/{id}/status` | Queue a device status report |
//! | GET | `/api/v1/targets/{id}/actions` | List a device's unfinished actions |

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use fleetgrid_core::FleetConfig;
use fleetgrid_rollout::{AggregatorHandle, RolloutError, StatusReport};
use fleetgrid_state::{ActionStatus, StateError, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::commands::action::DeviceAction;
use crate::commands::{Request, parse_keyword};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub config: Arc<FleetConfig>,
    /// Status reports go through the aggregator mailbox, never straight to the store.
    pub reports: AggregatorHandle,
}

/// Response wrapper shared by every endpoint and decoded by the CLI.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Body of a device status report.
#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: ActionStatus,
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/commands", post(run_command))
        .route("/actions/{id}/status", post(report_status))
        .route("/targets/{id}/actions", get(poll_actions))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// POST /api/v1/commands
pub async fn run_command(State(state): State<ApiState>, Json(request): Json<Request>) -> Response {
    let request = match request {
        Request::Action(DeviceAction::Report { action_id, status }) => {
            let status: ActionStatus = match parse_keyword("action status", &status) {
                Ok(status) => status,
                Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
            };
            return match queue(&state, action_id.clone(), status).await {
                Ok(()) => ApiResponse::ok(format!("report for {action_id} queued")).into_response(),
                Err(response) => response,
            };
        }
        other => other,
    };

    debug!(?request, "command received");
    let ApiState { store, config, .. } = state;
    match tokio::task::spawn_blocking(move || request.execute(&store, &config)).await {
        Ok(Ok(output)) => ApiResponse::ok(output).into_response(),
        Ok(Err(e)) => error_response(&e.to_string(), status_for(&e)),
        Err(e) => {
            warn!(error = %e, "command task failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/v1/actions/{id}/status
pub async fn report_status(
    State(state): State<ApiState>,
    Path(action_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Response {
    match queue(&state, action_id, body.status).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("queued")).into_response(),
        Err(response) => response,
    }
}

/// GET /api/v1/targets/{id}/actions
pub async fn poll_actions(State(state): State<ApiState>, Path(target_id): Path<String>) -> Response {
    let store = state.store;
    let listed = tokio::task::spawn_blocking(move || store.list_actions_for_target(&target_id)).await;
    match listed {
        Ok(Ok(actions)) => {
            let open: Vec<_> = actions.into_iter().filter(|a| !a.status.is_terminal()).collect();
            ApiResponse::ok(open).into_response()
        }
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn queue(state: &ApiState, action_id: String, status: ActionStatus) -> Result<(), Response> {
    state
        .reports
        .report(StatusReport::now(action_id, status))
        .await
        .map_err(|e| error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE))
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<RolloutError>() {
        Some(RolloutError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(
            RolloutError::Busy { .. }
            | RolloutError::AlreadyExists(_)
            | RolloutError::InvalidTransition { .. },
        ) => StatusCode::CONFLICT,
        Some(RolloutError::Persistence(_) | RolloutError::MailboxClosed) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Some(_) => StatusCode::BAD_REQUEST,
        None if err.downcast_ref::<StateError>().is_some() => StatusCode::INTERNAL_SERVER_ERROR,
        None => StatusCode::BAD_REQUEST,
    }
}
