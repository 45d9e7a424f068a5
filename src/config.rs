//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every section
//! has usable defaults so a missing file is not an error.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub channel: ChannelConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub analyzer: AnalyzerConfig,
    pub devices: DeviceConfig,
    pub ui: UiConfig,
}

/// Session negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint exchanging an agent id for a connection credential
    pub negotiate_url: String,
    /// Voice-search distance threshold forwarded to the negotiation endpoint
    pub distance_threshold: f32,
    /// Result-count limit forwarded to the negotiation endpoint
    pub limit: u32,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiate_url: "http://127.0.0.1:8000/api/realtime/session".to_string(),
            distance_threshold: 0.5,
            limit: 5,
            timeout_ms: 10_000,
        }
    }
}

/// Realtime channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// WebSocket URL of the realtime backend
    pub url: String,
    /// Input transcription model declared in `session.update`
    pub transcription_model: String,
    /// Turn detection mode declared in `session.update`
    pub turn_detection: TurnDetection,
    /// Number of recent inbound event ids remembered for duplicate detection
    pub dedup_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection::ServerVad,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Turn detection mode requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad,
    Manual,
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate requested from the device
    pub sample_rate: u32,
    /// Mono samples per capture chunk
    pub chunk_samples: usize,
    /// Device buffer size in frames (None = platform default)
    pub buffer_size: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_samples: DEFAULT_CHUNK_SAMPLES,
            buffer_size: None,
        }
    }
}

impl AudioConfig {
    /// Duration of one capture chunk in milliseconds
    pub fn chunk_duration_ms(&self) -> f32 {
        self.chunk_samples as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate of inbound assistant audio
    pub sample_rate: u32,
    /// Queued-but-unplayed audio above which the oldest fragments are dropped
    pub max_queued_ms: u32,
    /// Finished tracks kept around for offset queries
    pub retained_tracks: usize,
    /// Device buffer size in frames (None = platform default)
    pub buffer_size: Option<u32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_queued_ms: DEFAULT_MAX_QUEUED_MS,
            retained_tracks: DEFAULT_RETAINED_TRACKS,
            buffer_size: None,
        }
    }
}

impl PlaybackConfig {
    /// Overrun threshold in samples
    pub fn max_queued_samples(&self) -> usize {
        (self.sample_rate as u64 * self.max_queued_ms as u64 / 1000) as usize
    }
}

/// Visualization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// FFT window length, rounded up to a power of two
    pub fft_size: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
        }
    }
}

/// Device registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Interval between inventory polls while watching for changes
    pub poll_interval_ms: u64,
    /// Override for the persisted selection file
    pub selection_path: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            selection_path: None,
        }
    }
}

/// Local HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Project directories used for config and persisted state
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "realtime-voice", "realtime-voice")
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("no home directory for config".to_string()))?;
        self.save_to(&path)
    }

    /// Write to an explicit file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(Error::Config("sample rate must be non-zero".into()));
        }
        if self.audio.chunk_samples == 0 {
            return Err(Error::Config("chunk_samples must be non-zero".into()));
        }
        if self.playback.retained_tracks == 0 {
            return Err(Error::Config("retained_tracks must be at least 1".into()));
        }
        if self.analyzer.fft_size < 32 {
            return Err(Error::Config("fft_size must be at least 32".into()));
        }
        Ok(())
    }

    /// Path of the persisted device selection
    pub fn selection_path(&self) -> Option<PathBuf> {
        self.devices.selection_path.clone().or_else(|| {
            project_dirs().map(|dirs| dirs.data_dir().join("device-selection.toml"))
        })
    }
}
