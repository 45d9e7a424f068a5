//! # Realtime Voice
//!
//! Low-latency realtime voice conversation engine: microphone capture,
//! streaming to a remote conversational backend, gapless playback of the
//! synthesized reply with sample-accurate barge-in, and a live transcript.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               HOST PLATFORM                              │
//! │   ┌──────────────┐          ┌──────────────┐         ┌──────────────┐    │
//! │   │ Input Device │          │Output Device │         │ Device List  │    │
//! │   └──────┬───────┘          └──────▲───────┘         └──────┬───────┘    │
//! └──────────┼─────────────────────────┼────────────────────────┼────────────┘
//!            │ cpal callback           │ cpal callback          │ poll
//!            ▼                         │                        ▼
//! ┌──────────────────────┐  ┌──────────┴───────────┐  ┌──────────────────────┐
//! │ AudioCaptureEngine   │  │ AudioPlaybackEngine  │  │ DeviceRegistry       │
//! │ (audio::capture)     │  │ (audio::playback)    │  │ (audio::device)      │
//! │  ring → pump thread  │  │  TrackManager        │  │  persisted selection │
//! │  → CaptureChunk      │  │  (tracks::manager)   │  └──────────────────────┘
//! └──────┬───────┬───────┘  └──────▲───────┬───────┘
//!        │       │ tap             │       │ tap     ┌──────────────────────┐
//!        │       └─────────────────┼───────┴────────►│ FrequencyAnalyzer    │
//!        │ chunk                   │ fragment        │ (audio::analyzer)    │
//!        ▼                         │                 └──────────────────────┘
//! ┌────────────────────────────────┴─────────────────────────────────────────┐
//! │               SessionController (session) - single control task          │
//! │    SessionState  ·  Transcript (conversation)  ·  interruption round-trip │
//! └──────┬──────────────────────────▲────────────────────────────────────────┘
//!        │ OutboundEvent            │ InboundEvent
//!        ▼                          │
//! ┌─────────────────────────────────┴─────────────────────────────────────────┐
//! │ Channel adapter (channel) - WebSocket JSON events, HTTP negotiation       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod error;
pub mod protocol;
pub mod session;
pub mod tracks;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AudioError, ChannelError, Error, Result, SessionError};
pub use session::{SessionController, SessionDeps, SessionEvent, SessionHandle, SessionState};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture and playback (PCM16 mono)
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Default mono samples per capture chunk (200ms at 24kHz)
    pub const DEFAULT_CHUNK_SAMPLES: usize = 4_800;

    /// Queued playback audio above which the oldest fragments are dropped
    pub const DEFAULT_MAX_QUEUED_MS: u32 = 120_000;

    /// Finished playback tracks kept for offset queries
    pub const DEFAULT_RETAINED_TRACKS: usize = 8;

    /// Default FFT window for the analyzer
    pub const DEFAULT_FFT_SIZE: usize = 1_024;

    /// Inbound event ids remembered for duplicate detection
    pub const DEFAULT_DEDUP_WINDOW: usize = 512;

    /// Default port for the local control API
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Lock-free capture ring buffer capacity (in device callbacks)
    pub const RING_BUFFER_CAPACITY: usize = 256;

    /// Capacity of the session event broadcast
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}
