//! HTTP API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::analyzer::{AmplitudeFrame, AnalyzerSource, Band};
use crate::audio::device::AudioDevice;
use crate::conversation::ConversationItem;
use crate::error::{AudioError, Error, SessionError};
use crate::session::SessionState;
use crate::tracks::{PlaybackStats, TrackOffset};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::ok(data)))
}

fn failed<T>(status: StatusCode, msg: impl Into<String>) -> ApiResult<T> {
    (status, Json(ApiResponse::error(msg)))
}

fn session_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NegotiationFailed(_) | SessionError::ChannelOpenFailed(_) => StatusCode::BAD_GATEWAY,
        SessionError::DeviceUnavailable(_) | SessionError::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::NotConnected | SessionError::AlreadyConnected | SessionError::Cancelled => {
            StatusCode::CONFLICT
        }
    }
}

fn session_failed<T>(err: SessionError) -> ApiResult<T> {
    failed(session_status(&err), err.to_string())
}

/// System status
#[derive(Serialize)]
pub struct SystemStatus {
    pub state: SessionState,
    pub connected: bool,
    pub recording: bool,
    pub item_count: usize,
    pub last_notice: Option<String>,
    pub playback: Option<PlaybackStats>,
    pub uptime_seconds: u64,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let session = &state.session;
    let status = SystemStatus {
        state: session.state(),
        connected: session.is_connected(),
        recording: session.is_recording(),
        item_count: session.items().len(),
        last_notice: session.last_notice(),
        playback: session.playback_stats().await,
        uptime_seconds: state.started.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

#[derive(Serialize)]
pub struct DeviceList {
    pub devices: Vec<AudioDevice>,
    /// Effective input device after fallback
    pub selected: Option<String>,
}

/// Get available input devices
pub async fn get_devices(State(state): State<Arc<AppState>>) -> ApiResult<DeviceList> {
    let registry = state.registry.clone();
    let listed = tokio::task::spawn_blocking(move || {
        let devices = registry.list_devices()?;
        let selected = registry.resolve(&devices).map(|d| d.id);
        Ok::<_, AudioError>(DeviceList { devices, selected })
    })
    .await;

    match listed {
        Ok(Ok(list)) => ok(list),
        Ok(Err(e)) => failed(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e) => failed(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct SelectRequest {
    pub device_id: String,
}

/// Persist the input device choice
pub async fn select_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectRequest>,
) -> ApiResult<AudioDevice> {
    let registry = state.registry.clone();
    let selected = tokio::task::spawn_blocking(move || registry.select_device(&req.device_id)).await;

    match selected {
        Ok(Ok(device)) => ok(device),
        Ok(Err(Error::Audio(AudioError::DeviceUnavailable(id)))) => {
            failed(StatusCode::BAD_REQUEST, format!("unknown device: {}", id))
        }
        Ok(Err(e)) => failed(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => failed(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Get the transcript in conversation order
pub async fn get_transcript(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<ConversationItem>>> {
    Json(ApiResponse::ok(state.session.items()))
}

#[derive(Deserialize)]
pub struct AnalyzerQuery {
    #[serde(default)]
    pub band: Band,
    #[serde(default = "default_min_db")]
    pub min_db: f32,
    #[serde(default = "default_max_db")]
    pub max_db: f32,
}

fn default_min_db() -> f32 {
    -100.0
}

fn default_max_db() -> f32 {
    -30.0
}

/// Spectral snapshot of the capture or playback graph
pub async fn get_analyzer(
    State(state): State<Arc<AppState>>,
    Path(source): Path<AnalyzerSource>,
    Query(query): Query<AnalyzerQuery>,
) -> Json<ApiResponse<AmplitudeFrame>> {
    let frame = state.analyzer.sample(source, query.band, query.min_db, query.max_db);
    Json(ApiResponse::ok(frame))
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub agent_id: String,
}

pub async fn connect(State(state): State<Arc<AppState>>, Json(req): Json<ConnectRequest>) -> ApiResult<SessionState> {
    match state.session.connect(&req.agent_id).await {
        Ok(()) => ok(state.session.state()),
        Err(e) => session_failed(e),
    }
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<bool> {
    ok(state.session.disconnect().await)
}

pub async fn pause(State(state): State<Arc<AppState>>) -> ApiResult<bool> {
    ok(state.session.pause().await)
}

pub async fn resume(State(state): State<Arc<AppState>>) -> ApiResult<SessionState> {
    match state.session.resume().await {
        Ok(()) => ok(state.session.state()),
        Err(e) => session_failed(e),
    }
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub text: String,
}

/// Send a user text turn
pub async fn send_message(State(state): State<Arc<AppState>>, Json(req): Json<MessageRequest>) -> ApiResult<()> {
    if req.text.trim().is_empty() {
        return failed(StatusCode::BAD_REQUEST, "message text is empty");
    }
    match state.session.send_text_message(&req.text).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(()))),
        Err(e) => session_failed(e),
    }
}

/// Delete an item; `data` tells whether it was present locally
pub async fn delete_item(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<bool> {
    match state.session.delete_item(&id).await {
        Ok(removed) => ok(removed),
        Err(e) => session_failed(e),
    }
}

/// Progress of the audible track
pub async fn get_playback_offset(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Option<TrackOffset>>> {
    Json(ApiResponse::ok(state.session.active_track_offset().await))
}
