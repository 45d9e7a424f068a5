//! Error types for the voice conversation engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device enumeration failed: {0}")]
    DeviceEnumeration(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio engine is not connected")]
    NotConnected,

    #[error("No capture device is bound")]
    NotBound,

    #[error("Audio engine has ended")]
    EngineEnded,

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Conversation session errors, as surfaced to callers of the controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Failed to open realtime channel: {0}")]
    ChannelOpenFailed(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is already connected or connecting")]
    AlreadyConnected,

    #[error("Connect was cancelled by disconnect")]
    Cancelled,

    #[error("Session controller has shut down")]
    ControllerGone,
}

/// Realtime channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to open channel: {0}")]
    OpenFailed(String),

    #[error("Channel protocol error: {0}")]
    Protocol(String),

    #[error("Fatal channel error: {0}")]
    Fatal(String),

    #[error("Channel is closed")]
    Closed,
}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::NotConnected => SessionError::NotConnected,
            other => SessionError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::OpenFailed(reason) => SessionError::ChannelOpenFailed(reason),
            ChannelError::Closed => SessionError::NotConnected,
            other => SessionError::ChannelOpenFailed(other.to_string()),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
