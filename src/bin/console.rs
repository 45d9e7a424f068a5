//! Voice Console
//!
//! Talks to a realtime voice agent through the default audio devices and
//! exposes the local control API. Usage: `voice-console <agent-id>`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_voice::{
    audio::{
        device::{DeviceRegistry, FileSelectionStore, MemorySelectionStore, SelectionStore},
        AudioDevice, CpalInput, CpalInventory, CpalOutput, FrequencyAnalyzer, SampleTap,
    },
    channel::{HttpNegotiator, WebSocketConnector},
    config::AppConfig,
    session::{SessionController, SessionDeps, SessionEvent},
    ui::{AppState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Voice Console");

    let config = AppConfig::load().context("loading config")?;
    let agent_id = std::env::args().nth(1);

    let store: Arc<dyn SelectionStore> = match config.selection_path() {
        Some(path) => Arc::new(FileSelectionStore::new(path)),
        None => Arc::new(MemorySelectionStore::default()),
    };
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(CpalInventory),
        store,
        Duration::from_millis(config.devices.poll_interval_ms),
    ));

    // List available devices
    println!("\n=== Available Input Devices ===");
    let devices = registry.list_devices().unwrap_or_else(|e| {
        tracing::warn!("Device enumeration failed: {}", e);
        Vec::new()
    });
    let selected = registry.resolve(&devices);
    for device in &devices {
        print_device(device, selected.as_ref());
    }
    println!();

    let capture_tap = SampleTap::new(config.analyzer.fft_size * 2, config.audio.sample_rate);
    let playback_tap = SampleTap::new(config.analyzer.fft_size * 2, config.playback.sample_rate);

    let session = SessionController::spawn(
        &config,
        SessionDeps {
            negotiator: Arc::new(HttpNegotiator::new(&config.session)?),
            connector: Arc::new(WebSocketConnector::new(&config.channel)),
            input: Arc::new(CpalInput),
            output: Arc::new(CpalOutput::default()),
            registry: Some(registry.clone()),
            capture_tap: Some(capture_tap.clone()),
            playback_tap: Some(playback_tap.clone()),
        },
    );

    // Log notices and transcript progress
    let mut events = session.subscribe();
    let observer = session.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Notice(message) => println!("! {}", message),
                SessionEvent::ItemUpdated(id) => {
                    if let Some(item) = observer.item(&id) {
                        tracing::debug!("{:?} {}: {}", item.kind, item.id, item.text);
                    }
                }
                SessionEvent::StateChanged(state) => tracing::debug!("State {:?}", state),
                SessionEvent::ItemRemoved(id) => tracing::debug!("Removed {}", id),
            }
        }
    });

    // Hot-plug: re-resolve the effective input on every snapshot
    let watch_registry = registry.clone();
    tokio::spawn(async move {
        let mut watch = watch_registry.watch_device_changes();
        while let Some(snapshot) = watch.next().await {
            match watch_registry.resolve(&snapshot) {
                Some(device) => tracing::info!("Input device: {}", device.label),
                None => tracing::warn!("No input devices available"),
            }
        }
    });

    let _web_handle = if config.ui.enabled {
        let analyzer = FrequencyAnalyzer::new(capture_tap, playback_tap, config.analyzer.fft_size);
        let server = WebServer::new(
            config.ui.clone(),
            AppState::new(session.clone(), registry.clone(), analyzer),
        );
        tracing::info!(
            "Control API available at http://{}:{}",
            config.ui.bind_address,
            config.ui.http_port
        );
        Some(server.start_background())
    } else {
        None
    };

    match agent_id {
        Some(agent_id) => {
            tracing::info!("Connecting to agent {}", agent_id);
            if let Err(e) = session.connect(&agent_id).await {
                tracing::error!("Connect failed: {}", e);
            }
        }
        None => tracing::info!("No agent given; connect through the control API"),
    }

    tracing::info!("Running - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    session.disconnect().await;
    Ok(())
}

fn print_device(device: &AudioDevice, selected: Option<&AudioDevice>) {
    let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
    let selected_marker = if selected.is_some_and(|s| s.id == device.id) {
        " [SELECTED]"
    } else {
        ""
    };
    println!("  {}{}{}", device.label, default_marker, selected_marker);
    println!("    ID: {}", device.id);
}
