//! HTTP control plane: a thin axum shell over the supervisor handle.
//!
//! Money and quantities serialize as decimal strings; handlers translate
//! supervisor errors into status codes and structured reasons.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use stratequeue_config::CredentialStore;
use stratequeue_core::StrategyId;
use stratequeue_runtime::{
    DeploySpec, ShutdownSignal, StopOptions, SupervisorError, SupervisorHandle,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared state handed to every handler.
pub struct AppState {
    pub supervisor: SupervisorHandle,
    pub credentials: CredentialStore,
    pub upload_dir: PathBuf,
}

/// Build the control-plane router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/deploy/validate", post(deploy_validate))
        .route("/deploy/start", post(deploy_start))
        .route("/strategies", get(list_strategies))
        .route("/strategies/{id}/statistics", get(strategy_statistics))
        .route("/strategies/{id}/pause", post(pause_strategy))
        .route("/strategies/{id}/resume", post(resume_strategy))
        .route("/strategies/{id}/stop", post(stop_strategy))
        .route("/engines", get(list_engines))
        .route("/upload_strategy", post(upload_strategy))
        .route("/config", post(set_config))
        .with_state(Arc::new(state))
}

/// Serve the control plane until the shutdown signal trips.
pub fn spawn_control_plane(
    addr: SocketAddr,
    state: AppState,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    let router = build_router(state);
    info!(%addr, "starting control plane server");
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%addr, error = %err, "control plane failed to bind");
                shutdown.trigger();
                return;
            }
        };
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await;
        if let Err(err) = result {
            warn!(error = %err, "control plane server exited with error");
        }
    })
}

/// Error envelope rendered for every failing handler.
struct ApiError {
    status: StatusCode,
    message: String,
    errors: Vec<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            errors: Vec::new(),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Validation(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                message: "deploy spec invalid".to_string(),
                errors,
            },
            SupervisorError::UnknownStrategy(id) => {
                Self::new(StatusCode::NOT_FOUND, format!("unknown strategy: {id}"))
            }
            SupervisorError::InvalidState(reason) => Self::new(StatusCode::CONFLICT, reason),
            SupervisorError::ChannelClosed => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "runtime is shutting down")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "message": self.message, "errors": self.errors });
        (self.status, Json(body)).into_response()
    }
}

type SharedState = State<Arc<AppState>>;

async fn deploy_validate(
    State(state): SharedState,
    Json(spec): Json<DeploySpec>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let errors = state.supervisor.validate(spec).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "valid": errors.is_empty(), "errors": errors })))
}

async fn deploy_start(
    State(state): SharedState,
    Json(spec): Json<DeploySpec>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = state.supervisor.deploy(spec).await.map_err(ApiError::from)?;
    Ok(Json(json!({
        "id": id.as_str(),
        "message": format!("strategy {id} deployed"),
    })))
}

#[derive(Serialize)]
struct StrategySummary {
    id: String,
    name: String,
    status: stratequeue_core::StrategyStatus,
    mode: stratequeue_core::TradingMode,
    symbols: Vec<String>,
    allocation: stratequeue_core::Allocation,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    last_signal: Option<chrono::DateTime<chrono::Utc>>,
    last_signal_type: Option<stratequeue_core::SignalType>,
    data_source: String,
    granularity: stratequeue_core::Granularity,
}

async fn list_strategies(
    State(state): SharedState,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.supervisor.list().await.map_err(ApiError::from)?;
    let strategies: Vec<StrategySummary> = records
        .into_iter()
        .map(|record| StrategySummary {
            id: record.id.to_string(),
            name: record.name,
            status: record.status,
            mode: record.mode,
            symbols: record.symbols,
            allocation: record.allocation,
            started_at: record.started_at,
            last_signal: record.last_signal_ts,
            last_signal_type: record.last_signal_type,
            data_source: record.data_source,
            granularity: record.granularity,
        })
        .collect();
    Ok(Json(json!({ "strategies": strategies })))
}

async fn strategy_statistics(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state
        .supervisor
        .snapshot(StrategyId::new(&id))
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown strategy: {id}")))?;
    Ok(Json(json!({
        "metrics": snapshot.stats,
        "ledger": snapshot.ledger,
        "status": snapshot.record.status,
    })))
}

async fn pause_strategy(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .supervisor
        .pause(StrategyId::new(&id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "message": format!("strategy {id} paused") })))
}

async fn resume_strategy(
    State(state): SharedState,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .supervisor
        .resume(StrategyId::new(&id))
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "message": format!("strategy {id} resumed") })))
}

#[derive(Debug, Default, Deserialize)]
struct StopBody {
    #[serde(default)]
    liquidate: bool,
    #[serde(default)]
    force: bool,
}

async fn stop_strategy(
    State(state): SharedState,
    Path(id): Path<String>,
    body: Option<Json<StopBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.unwrap_or_default();
    state
        .supervisor
        .stop(
            StrategyId::new(&id),
            StopOptions {
                liquidate: body.liquidate,
                force: body.force,
            },
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "message": format!("strategy {id} stopping") })))
}

async fn list_engines(State(state): SharedState) -> Json<serde_json::Value> {
    let engines: Vec<serde_json::Value> = state
        .supervisor
        .engines()
        .into_iter()
        .map(|name| json!({ "name": name, "available": true }))
        .collect();
    Json(json!({ "engines": engines }))
}

async fn upload_strategy(
    State(state): SharedState,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("malformed upload: {err}"))
    })? {
        let Some(file_name) = field.file_name().map(sanitize_file_name) else {
            continue;
        };
        if file_name.is_empty() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty file name"));
        }
        let bytes = field.bytes().await.map_err(|err| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("upload read failed: {err}"))
        })?;
        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .map_err(|err| {
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("upload dir: {err}"),
                )
            })?;
        let path = state.upload_dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await.map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("write failed: {err}"),
            )
        })?;
        info!(path = %path.display(), bytes = bytes.len(), "strategy uploaded");
        return Ok(Json(json!({ "path": path.to_string_lossy() })));
    }
    Err(ApiError::new(StatusCode::BAD_REQUEST, "no file field"))
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

async fn set_config(
    State(state): SharedState,
    Json(values): Json<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = values.len();
    state.credentials.set_many(&values).map_err(|err| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("credential store: {err}"),
        )
    })?;
    Ok(Json(json!({ "message": format!("{count} credentials stored") })))
}
