//! Per-utterance playback timeline

use std::collections::VecDeque;

/// Lifecycle of a playback track
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Created, waiting for the previous track to finish
    Pending,
    /// Currently audible
    Active,
    /// Played out naturally
    Completed,
    /// Cut off by an interruption
    Interrupted,
}

impl TrackState {
    pub fn is_finished(self) -> bool {
        matches!(self, TrackState::Completed | TrackState::Interrupted)
    }
}

/// Variable-length PCM16 audio for one track
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFragment {
    pub track_id: String,
    pub samples: Vec<i16>,
}

impl PlaybackFragment {
    pub fn new(track_id: impl Into<String>, samples: Vec<i16>) -> Self {
        Self {
            track_id: track_id.into(),
            samples,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Cumulative sample timeline of one track
///
/// `position` counts samples that have left the queue, either handed to the
/// output device or skipped by overrun recovery; `position <= enqueued`.
#[derive(Debug)]
pub struct PlaybackTrack {
    id: String,
    fragments: VecDeque<Vec<i16>>,
    /// Read cursor into the front fragment
    cursor: usize,
    enqueued: u64,
    position: u64,
    played: u64,
    dropped: u64,
    /// No more fragments are expected
    sealed: bool,
    state: TrackState,
}

impl PlaybackTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fragments: VecDeque::new(),
            cursor: 0,
            enqueued: 0,
            position: 0,
            played: 0,
            dropped: 0,
            sealed: false,
            state: TrackState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TrackState) {
        self.state = state;
    }

    /// Total samples ever scheduled on this track
    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Timeline position reached by the output
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn played(&self) -> u64 {
        self.played
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Samples scheduled but not yet played
    pub fn pending(&self) -> usize {
        (self.enqueued - self.position) as usize
    }

    pub(crate) fn push(&mut self, samples: Vec<i16>) {
        if samples.is_empty() {
            return;
        }
        self.enqueued += samples.len() as u64;
        self.fragments.push_back(samples);
    }

    /// Copy queued samples into `out` in enqueue order; returns count written
    pub(crate) fn read_into(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let Some(front) = self.fragments.front() else {
                break;
            };
            let available = front.len() - self.cursor;
            let take = available.min(out.len() - written);
            out[written..written + take].copy_from_slice(&front[self.cursor..self.cursor + take]);
            written += take;
            self.cursor += take;

            if self.cursor == front.len() {
                self.fragments.pop_front();
                self.cursor = 0;
            }
        }

        self.position += written as u64;
        self.played += written as u64;
        written
    }

    /// Skip the rest of the oldest fragment; returns samples skipped
    pub(crate) fn drop_oldest(&mut self) -> usize {
        let Some(front) = self.fragments.pop_front() else {
            return 0;
        };
        let skipped = front.len() - self.cursor;
        self.cursor = 0;
        self.position += skipped as u64;
        self.dropped += skipped as u64;
        skipped
    }

    /// Discard everything not yet played; the position stays where it is
    pub(crate) fn flush(&mut self) -> usize {
        let discarded = self.pending();
        self.fragments.clear();
        self.cursor = 0;
        self.enqueued = self.position;
        discarded
    }
}
