//! Playback track management module

pub mod manager;
pub mod track;

pub use manager::{
    EnqueueOutcome, InterruptionMarker, PlaybackStats, SharedTrackManager, TrackManager, TrackOffset,
};
pub use track::{PlaybackFragment, PlaybackTrack, TrackState};
