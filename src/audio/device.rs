//! Audio device enumeration, hot-plug watching and persisted selection

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AudioError, Error};

/// Direction of an audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
}

impl DeviceKind {
    fn prefix(self) -> &'static str {
        match self {
            DeviceKind::Input => "input:",
            DeviceKind::Output => "output:",
        }
    }
}

/// One entry of a device snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Stable platform id, e.g. `input:USB Microphone`
    pub id: String,
    /// Human label
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// Source of device snapshots
pub trait DeviceInventory: Send + Sync {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<AudioDevice>, AudioError>;
}

/// Device inventory backed by the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInventory;

impl DeviceInventory for CpalInventory {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<AudioDevice>, AudioError> {
        let host = cpal::default_host();

        let (default_name, devices) = match kind {
            DeviceKind::Input => (
                host.default_input_device().and_then(|d| d.name().ok()),
                host.input_devices(),
            ),
            DeviceKind::Output => (
                host.default_output_device().and_then(|d| d.name().ok()),
                host.output_devices(),
            ),
        };
        let devices = devices.map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?;

        let mut listed = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                // Some hosts list the same endpoint twice
                if listed.iter().any(|d: &AudioDevice| d.label == name) {
                    continue;
                }
                listed.push(AudioDevice {
                    id: format!("{}{}", kind.prefix(), name),
                    is_default: default_name.as_ref() == Some(&name),
                    label: name,
                    kind,
                });
            }
        }

        Ok(listed)
    }
}

/// Resolve a device id (or the default when None) to a cpal device
pub fn find_cpal_device(kind: DeviceKind, id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let default = match kind {
            DeviceKind::Input => host.default_input_device(),
            DeviceKind::Output => host.default_output_device(),
        };
        return default.ok_or_else(|| AudioError::DeviceUnavailable("no default device".to_string()));
    };

    // Bare names are accepted for ids written by older configs
    let name = id.strip_prefix(kind.prefix()).unwrap_or(id);

    let devices = match kind {
        DeviceKind::Input => host.input_devices(),
        DeviceKind::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceUnavailable(id.to_string()))
}

/// Channel count and rate a cpal device will actually be opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub channels: u16,
    pub sample_rate: u32,
}

/// Pick a rate the device supports: the requested one when possible,
/// else the device default, else the supported rate closest to the request
pub fn choose_sample_rate(supported: &[(u32, u32)], requested: u32, default: u32) -> u32 {
    let contains = |rate: u32| supported.iter().any(|&(min, max)| (min..=max).contains(&rate));
    if supported.is_empty() {
        return default;
    }
    if contains(requested) {
        return requested;
    }
    if contains(default) {
        return default;
    }
    supported
        .iter()
        .map(|&(min, max)| requested.clamp(min, max))
        .min_by_key(|&rate| rate.abs_diff(requested))
        .unwrap_or(default)
}

/// Resolve the stream settings for `device`, keeping its default channel
/// layout and negotiating the rate against its supported configs
pub fn stream_settings(device: &cpal::Device, kind: DeviceKind, requested: u32) -> Result<StreamSettings, AudioError> {
    let (default, ranges) = match kind {
        DeviceKind::Input => (
            device.default_input_config(),
            device.supported_input_configs().map(|it| it.collect::<Vec<_>>()),
        ),
        DeviceKind::Output => (
            device.default_output_config(),
            device.supported_output_configs().map(|it| it.collect::<Vec<_>>()),
        ),
    };
    let default = default.map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    let channels = default.channels();

    let supported: Vec<(u32, u32)> = ranges
        .unwrap_or_default()
        .iter()
        .filter(|range| range.channels() == channels)
        .map(|range| (range.min_sample_rate().0, range.max_sample_rate().0))
        .collect();
    let sample_rate = choose_sample_rate(&supported, requested, default.sample_rate().0);
    if sample_rate != requested {
        tracing::info!("Device does not run at {} Hz, opening at {} Hz", requested, sample_rate);
    }

    Ok(StreamSettings { channels, sample_rate })
}

/// Durable storage for the selected input device id
pub trait SelectionStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, id: &str) -> Result<(), Error>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectionFile {
    input_device: Option<String>,
}

/// Selection persisted as a small TOML file
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SelectionStore for FileSelectionStore {
    fn load(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match toml::from_str::<SelectionFile>(&text) {
            Ok(file) => file.input_device,
            Err(e) => {
                tracing::warn!("Ignoring unreadable device selection {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, id: &str) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = SelectionFile {
            input_device: Some(id.to_string()),
        };
        let text = toml::to_string(&file).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Selection kept in memory only
#[derive(Default)]
pub struct MemorySelectionStore {
    selected: parking_lot::Mutex<Option<String>>,
}

impl SelectionStore for MemorySelectionStore {
    fn load(&self) -> Option<String> {
        self.selected.lock().clone()
    }

    fn save(&self, id: &str) -> Result<(), Error> {
        *self.selected.lock() = Some(id.to_string());
        Ok(())
    }
}

/// Pick the effective device from a snapshot: persisted id, then the
/// platform default, then the first device
pub fn resolve_selection(persisted: Option<&str>, snapshot: &[AudioDevice]) -> Option<AudioDevice> {
    persisted
        .and_then(|id| snapshot.iter().find(|d| d.id == id))
        .or_else(|| snapshot.iter().find(|d| d.is_default))
        .or_else(|| snapshot.first())
        .cloned()
}

/// Stream of device snapshots; polling stops when dropped
pub struct DeviceWatch {
    rx: mpsc::UnboundedReceiver<Vec<AudioDevice>>,
    task: JoinHandle<()>,
}

impl DeviceWatch {
    /// Next snapshot that differs from the previous one
    pub async fn next(&mut self) -> Option<Vec<AudioDevice>> {
        self.rx.recv().await
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Capture device inventory plus the user's persisted choice
pub struct DeviceRegistry {
    inventory: Arc<dyn DeviceInventory>,
    store: Arc<dyn SelectionStore>,
    poll_interval: Duration,
}

impl DeviceRegistry {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        store: Arc<dyn SelectionStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            store,
            poll_interval,
        }
    }

    /// Current capture devices
    pub fn list_devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        self.inventory.enumerate(DeviceKind::Input)
    }

    /// Start watching for hot-plug changes
    ///
    /// The first snapshot is delivered immediately; afterwards only changed
    /// snapshots are sent. Must be called inside a tokio runtime.
    pub fn watch_device_changes(&self) -> DeviceWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let inventory = self.inventory.clone();
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last: Option<Vec<AudioDevice>> = None;

            loop {
                ticker.tick().await;

                let inventory = inventory.clone();
                let polled = tokio::task::spawn_blocking(move || inventory.enumerate(DeviceKind::Input)).await;
                let snapshot = match polled {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        tracing::warn!("Device poll failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Device poll task failed: {}", e);
                        continue;
                    }
                };

                if last.as_ref() == Some(&snapshot) {
                    continue;
                }
                tracing::debug!("Device snapshot changed: {} inputs", snapshot.len());
                last = Some(snapshot.clone());
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
        });

        DeviceWatch { rx, task }
    }

    /// Persist the chosen input device; it must exist right now
    pub fn select_device(&self, id: &str) -> Result<AudioDevice, Error> {
        let devices = self.list_devices()?;
        let device = devices
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| AudioError::DeviceUnavailable(id.to_string()))?;
        self.store.save(id)?;
        tracing::info!("Selected input device {}", device.label);
        Ok(device)
    }

    /// Effective input device against the current snapshot
    pub fn selected_device(&self) -> Result<Option<AudioDevice>, AudioError> {
        let devices = self.list_devices()?;
        Ok(self.resolve(&devices))
    }

    /// Effective input device against a given snapshot
    pub fn resolve(&self, snapshot: &[AudioDevice]) -> Option<AudioDevice> {
        resolve_selection(self.store.load().as_deref(), snapshot)
    }
}
