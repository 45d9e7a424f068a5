//! Local HTTP control and observation API

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audio::analyzer::FrequencyAnalyzer;
use crate::audio::device::DeviceRegistry;
use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::session::SessionHandle;
use crate::ui::handlers;

/// Everything the handlers read from
pub struct AppState {
    pub session: SessionHandle,
    pub registry: Arc<DeviceRegistry>,
    pub analyzer: FrequencyAnalyzer,
    pub started: Instant,
}

impl AppState {
    pub fn new(session: SessionHandle, registry: Arc<DeviceRegistry>, analyzer: FrequencyAnalyzer) -> Self {
        Self {
            session,
            registry,
            analyzer,
            started: Instant::now(),
        }
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/devices/select", post(handlers::select_device))
        .route("/api/transcript", get(handlers::get_transcript))
        .route("/api/analyzer/:source", get(handlers::get_analyzer))
        .route("/api/session/connect", post(handlers::connect))
        .route("/api/session/disconnect", post(handlers::disconnect))
        .route("/api/session/pause", post(handlers::pause))
        .route("/api/session/resume", post(handlers::resume))
        .route("/api/messages", post(handlers::send_message))
        .route("/api/items/:id", delete(handlers::delete_item))
        .route("/api/playback/offset", get(handlers::get_playback_offset))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serves the API on the configured address
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))
    }

    /// Serve until the task is dropped or the listener fails
    pub async fn run(self) -> Result<()> {
        let addr = self.address()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Control API listening on http://{}", addr);
        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }

    /// Serve on a background task
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control API stopped: {}", e);
            }
        })
    }
}
