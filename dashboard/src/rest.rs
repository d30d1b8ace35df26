use crate::dispatcher::CommandDispatcher;
use crate::errors::Error;
use crate::model::{
    CommandKind, CommandRecord, CommandRequest, ConnectivityResponse, DispatchState,
    StatusResponse,
};
use crate::observer::StatusObserver;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub observer: Arc<StatusObserver>,
    pub dispatcher: Arc<CommandDispatcher>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/connectivity", get(get_connectivity))
        .route("/api/v1/commands", post(post_command))
        .route("/api/v1/commands/state", get(get_dispatch_state))
        .route("/health", get(health))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.observer.latest_status(),
    })
}

async fn get_connectivity(State(state): State<AppState>) -> Json<ConnectivityResponse> {
    let connectivity = state.observer.connectivity_state();
    let last_updated = state
        .observer
        .latest_status()
        .and_then(|record| record.last_updated());

    Json(ConnectivityResponse {
        online: connectivity.is_online(),
        state: connectivity,
        last_updated,
    })
}

async fn post_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandRecord>), AppError> {
    let command: CommandKind = request.command.parse()?;
    let record = state.dispatcher.try_dispatch(command).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn get_dispatch_state(State(state): State<AppState>) -> Json<DispatchState> {
    Json(state.dispatcher.state())
}

async fn health() -> &'static str {
    "ok"
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::MalformedRecord(_)) => StatusCode::BAD_REQUEST,
            Some(Error::DispatchInFlight) => StatusCode::CONFLICT,
            Some(Error::ChannelWrite(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("Rejected request: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
