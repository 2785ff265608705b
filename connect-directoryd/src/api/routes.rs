use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::types::{DirectoryEntry, DirectorySnapshot};
use crate::error::DirectoryError;
use crate::task::{ActivationTimeouts, DirectoryTask};

#[derive(Clone)]
pub struct AppState {
    pub task: Arc<DirectoryTask>,
    pub hash_rx: watch::Receiver<String>,
    /// Timeouts used when a request does not name its own
    pub timeouts: ActivationTimeouts,
}

#[derive(Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Deserialize)]
pub struct ActivateQuery {
    #[serde(default)]
    pub transfer: bool,
    pub activation_timeout: Option<f64>,
    pub transfer_timeout: Option<f64>,
}

#[derive(Deserialize)]
pub struct TimeoutQuery {
    pub timeout: Option<f64>,
}

impl TimeoutQuery {
    /// Requested wait, clamped like an activation timeout
    fn duration(&self, state: &AppState) -> std::time::Duration {
        match self.timeout {
            Some(secs) => ActivationTimeouts::new(secs, state.timeouts.transfer.as_secs_f64()).activation,
            None => state.timeouts.activation,
        }
    }
}

#[derive(Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub dynamic_only: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A library error on its way out as an HTTP response
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found", what),
        }
    }
}

pub fn status_for(err: &DirectoryError) -> StatusCode {
    match err {
        DirectoryError::DeviceNotFound { .. } => StatusCode::NOT_FOUND,
        DirectoryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DirectoryError::Protocol { .. }
        | DirectoryError::Launch { .. }
        | DirectoryError::Http { .. }
        | DirectoryError::WebApi(_) => StatusCode::BAD_GATEWAY,
        DirectoryError::Busy(_) => StatusCode::CONFLICT,
        DirectoryError::NotCastDevice(_) | DirectoryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        DirectoryError::DiscoveryDisabled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", err);
        } else {
            tracing::debug!("Request rejected: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Run a directory call off the async runtime; every task operation may
/// wait on the network or the directory actor.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&DirectoryTask) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = state.task.clone();
    match tokio::task::spawn_blocking(move || f(&task)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!("Directory call aborted: {}", e);
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: e.to_string(),
            })
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices", get(get_devices))
        .route("/v1/devices/hash", get(get_hash))
        .route("/v1/devices/active", get(get_active_device))
        .route("/v1/devices/:value", get(get_device).delete(remove_device))
        .route("/v1/devices/:value/activate", post(activate_device))
        .route("/v1/devices/:value/describe", post(describe_device))
        .route("/v1/devices/:value/connect", post(connect_device))
        .route("/v1/devices/:value/disconnect", post(disconnect_device))
        .with_state(state)
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<RefreshQuery>,
) -> Result<Json<DirectorySnapshot>, ApiError> {
    blocking(&state, move |task| {
        if params.refresh {
            task.refresh_dynamic_devices()?;
        }
        task.get_devices()
    })
    .await
    .map(Json)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_active_device(
    State(state): State<AppState>,
    Query(params): Query<RefreshQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    blocking(&state, move |task| task.get_active_device(params.refresh))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("active device"))
}

async fn get_device(
    State(state): State<AppState>,
    Path(value): Path<String>,
    Query(params): Query<RefreshQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    let lookup = value.clone();
    blocking(&state, move |task| task.get_device(&lookup, params.refresh, true))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&value))
}

async fn activate_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ActivateQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    let timeouts = match (params.activation_timeout, params.transfer_timeout) {
        (None, None) => state.timeouts,
        (activation, transfer) => ActivationTimeouts::new(
            activation.unwrap_or(state.timeouts.activation.as_secs_f64()),
            transfer.unwrap_or(state.timeouts.transfer.as_secs_f64()),
        ),
    };
    blocking(&state, move |task| {
        task.activate_and_optionally_transfer(&name, params.transfer, timeouts)
    })
    .await
    .map(Json)
}

async fn describe_device(
    State(state): State<AppState>,
    Path(value): Path<String>,
    Query(params): Query<TimeoutQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    let timeout = params.duration(&state);
    blocking(&state, move |task| task.describe_device(&value, timeout))
        .await
        .map(Json)
}

async fn connect_device(
    State(state): State<AppState>,
    Path(value): Path<String>,
    Query(params): Query<TimeoutQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    let timeout = params.duration(&state);
    blocking(&state, move |task| task.connect_device(&value, timeout))
        .await
        .map(Json)
}

async fn disconnect_device(
    State(state): State<AppState>,
    Path(value): Path<String>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    blocking(&state, move |task| task.disconnect_device(&value))
        .await
        .map(Json)
}

async fn remove_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RemoveQuery>,
) -> Result<Json<DirectoryEntry>, ApiError> {
    let lookup = id.clone();
    blocking(&state, move |task| task.remove_device(&lookup, params.dynamic_only))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&DirectoryError::not_found("Office")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&DirectoryError::timeout("transfer", Duration::from_secs(10))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&DirectoryError::Launch {
                device: "Kitchen".to_string(),
                message: "LAUNCH_ERROR".to_string(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&DirectoryError::Busy("Kitchen".to_string())), StatusCode::CONFLICT);
        assert_eq!(status_for(&DirectoryError::DirectoryClosed), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
