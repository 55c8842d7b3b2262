use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::catalog::Plant;
use crate::error::HubError;
use crate::hub::HubHandle;
use crate::registry::{Device, NO_COMMAND};
use crate::scheduler::{now_unix, CycleStatus};
use crate::state::StatusResponse;
use crate::wire::{
    export_devices, parse_ping_body, AddPlantRequest, AssignRequest, CommandRequest,
    DurationRequest,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadRequest(String),
    Hub(HubError),
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self::Hub(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Hub(e) => {
                let status = match e {
                    HubError::DuplicatePlant(_) | HubError::CatalogFull => StatusCode::CONFLICT,
                    HubError::EmptyPlantName
                    | HubError::UnassignablePosition(_)
                    | HubError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
                    HubError::UnknownDevice(_) | HubError::UnknownPlant(_) => StatusCode::NOT_FOUND,
                    HubError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(handle: HubHandle) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/ping", post(api_ping))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/command", get(get_command).put(set_command))
        .route("/api/devices/{id}/assign", post(assign_device))
        .route("/api/plants", get(list_plants).post(add_plant))
        .route("/api/cycle", get(cycle_status))
        .route("/api/cycle/duration", put(set_duration))
        .route("/api/cycle/start", post(start_cycle))
        .route("/api/cycle/reset", post(reset_cycle))
        .route("/api/export", get(export))
        .with_state(handle)
}

async fn api_status(State(hub): State<HubHandle>) -> Json<StatusResponse> {
    Json(hub.snapshot().to_status(now_unix()))
}

/// Device liveness report. The body carries the device id; the peer address
/// is what gets reconciled. The reply is the device's pending command.
async fn api_ping(
    State(hub): State<HubHandle>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> ApiResult<String> {
    let device_id = parse_ping_body(&body).map_err(ApiError::BadRequest)?;
    let address = peer.ip().to_string();
    debug!(device_id, address = %address, "web: ping");

    hub.report_ping(address).await?;
    Ok(hub
        .get_device_command(device_id)
        .unwrap_or_else(|| NO_COMMAND.to_string()))
}

async fn list_devices(State(hub): State<HubHandle>) -> Json<Vec<Device>> {
    Json(hub.list_devices())
}

#[derive(Serialize)]
struct CommandReply {
    device_id: u64,
    command: String,
}

async fn get_command(
    State(hub): State<HubHandle>,
    Path(id): Path<u64>,
) -> ApiResult<Json<CommandReply>> {
    let command = hub
        .get_device_command(id)
        .ok_or(HubError::UnknownDevice(id))?;
    Ok(Json(CommandReply {
        device_id: id,
        command,
    }))
}

async fn set_command(
    State(hub): State<HubHandle>,
    Path(id): Path<u64>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<StatusCode> {
    hub.set_device_command(id, req.command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_device(
    State(hub): State<HubHandle>,
    Path(id): Path<u64>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Json<Device>> {
    let device = hub.assign_device(id, req.plant_index, req.position).await?;
    Ok(Json(device))
}

async fn list_plants(State(hub): State<HubHandle>) -> Json<Vec<Plant>> {
    Json(hub.list_plants())
}

async fn add_plant(
    State(hub): State<HubHandle>,
    Json(req): Json<AddPlantRequest>,
) -> ApiResult<(StatusCode, Json<Plant>)> {
    let plant = hub.add_plant(req.name).await?;
    Ok((StatusCode::CREATED, Json(plant)))
}

async fn cycle_status(State(hub): State<HubHandle>) -> Json<CycleStatus> {
    Json(hub.get_cycle_status())
}

async fn set_duration(
    State(hub): State<HubHandle>,
    Json(req): Json<DurationRequest>,
) -> ApiResult<Json<CycleStatus>> {
    let seconds = req.to_seconds().ok_or_else(|| {
        ApiError::BadRequest("give exactly one of 'seconds' or 'minutes'".to_string())
    })?;
    Ok(Json(hub.set_cycle_duration(seconds).await?))
}

async fn start_cycle(State(hub): State<HubHandle>) -> ApiResult<Json<CycleStatus>> {
    Ok(Json(hub.start_cycle().await?))
}

async fn reset_cycle(State(hub): State<HubHandle>) -> ApiResult<Json<CycleStatus>> {
    Ok(Json(hub.reset_cycle().await?))
}

async fn export(State(hub): State<HubHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        export_devices(&hub.list_devices()),
    )
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(handle: HubHandle, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(
        listener,
        router(handle).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
