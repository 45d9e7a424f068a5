//! Track scheduling for gapless playback with interruption
//!
//! The output callback pulls samples through [`TrackManager::render`]; the
//! control task pushes fragments and interrupts through the same mutex, so an
//! interruption takes effect at the next callback at the latest.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio::buffer::SampleTap;
use crate::tracks::track::{PlaybackFragment, PlaybackTrack, TrackState};

/// Where playback was cut off
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterruptionMarker {
    pub track_id: String,
    /// Samples of the track handed to the output device before the cut
    pub sample_offset: u64,
    pub wall_clock_time: DateTime<Utc>,
}

/// Read-only view of a track's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackOffset {
    pub track_id: String,
    pub offset: u64,
    pub enqueued: u64,
}

/// Result of scheduling a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Scheduled,
    /// The track already finished; the samples were discarded
    Rejected(TrackState),
}

/// Playback counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlaybackStats {
    pub played: u64,
    pub underrun: u64,
    pub dropped: u64,
    pub interrupted: u64,
}

/// Interrupted track ids remembered after their timelines are evicted
const INTERRUPTED_HISTORY: usize = 256;

/// Timeline registry: at most one active track, finished tracks retained
/// for offset queries until evicted
pub struct TrackManager {
    tracks: VecDeque<PlaybackTrack>,
    /// Outlives eviction so late fragments of a cut track stay silent
    interrupted: VecDeque<String>,
    active: Option<String>,
    max_queued: usize,
    retained: usize,
    stats: PlaybackStats,
    tap: Option<SampleTap>,
}

/// Handle shared between the control task and the output callback
pub type SharedTrackManager = Arc<Mutex<TrackManager>>;

impl TrackManager {
    pub fn new(max_queued: usize, retained: usize) -> Self {
        Self {
            tracks: VecDeque::new(),
            interrupted: VecDeque::new(),
            active: None,
            max_queued,
            retained,
            stats: PlaybackStats::default(),
            tap: None,
        }
    }

    pub fn shared(max_queued: usize, retained: usize) -> SharedTrackManager {
        Arc::new(Mutex::new(Self::new(max_queued, retained)))
    }

    /// Mirror rendered audio into an analysis tap
    pub fn set_tap(&mut self, tap: Option<SampleTap>) {
        self.tap = tap;
    }

    fn find(&self, id: &str) -> Option<&PlaybackTrack> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut PlaybackTrack> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    fn active_mut(&mut self) -> Option<&mut PlaybackTrack> {
        let id = self.active.clone()?;
        self.find_mut(&id)
    }

    /// Append a fragment to its track, creating the track on first use
    pub fn enqueue(&mut self, fragment: PlaybackFragment) -> EnqueueOutcome {
        let PlaybackFragment { track_id, samples } = fragment;
        if self.interrupted.iter().any(|id| *id == track_id) {
            return EnqueueOutcome::Rejected(TrackState::Interrupted);
        }

        match self.find_mut(&track_id) {
            Some(track) if track.state().is_finished() => {
                return EnqueueOutcome::Rejected(track.state());
            }
            Some(track) => track.push(samples),
            None => {
                let mut track = PlaybackTrack::new(track_id.clone());
                track.push(samples);
                tracing::debug!("New playback track {}", track_id);
                self.tracks.push_back(track);
                if self.active.is_none() {
                    self.activate(track_id);
                }
            }
        }

        self.enforce_overrun();
        EnqueueOutcome::Scheduled
    }

    fn activate(&mut self, id: String) {
        if let Some(track) = self.find_mut(&id) {
            track.set_state(TrackState::Active);
        }
        self.active = Some(id);
    }

    /// Promote the oldest pending track, if any
    fn activate_next(&mut self) -> bool {
        let next = self
            .tracks
            .iter()
            .find(|t| t.state() == TrackState::Pending)
            .map(|t| t.id().to_string());
        match next {
            Some(id) => {
                self.activate(id);
                true
            }
            None => false,
        }
    }

    fn has_waiting_track(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.state() == TrackState::Pending && t.pending() > 0)
    }

    /// Fill `out` with the next samples to reach the device; silence where
    /// nothing is queued. Returns the number of non-silent samples.
    pub fn render(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;

        while written < out.len() {
            if self.active.is_none() && !self.activate_next() {
                break;
            }
            let Some(active) = self.active_mut() else {
                self.active = None;
                break;
            };
            written += active.read_into(&mut out[written..]);

            if written == out.len() || active.pending() > 0 {
                break;
            }
            // Drained: exhausted once sealed or a later track has audio waiting
            let sealed = active.is_sealed();
            if !sealed && !self.has_waiting_track() {
                break;
            }
            if let Some(done) = self.active_mut() {
                done.set_state(TrackState::Completed);
                tracing::debug!("Track {} completed at {}", done.id(), done.position());
            }
            self.active = None;
        }

        if written < out.len() {
            out[written..].fill(0);
            if self.active.is_some() {
                self.stats.underrun += (out.len() - written) as u64;
            }
        }
        self.stats.played += written as u64;

        if let Some(tap) = &self.tap {
            tap.write(out);
        }
        self.evict();
        written
    }

    /// Mark a track as fully received so it completes once drained
    pub fn finish_track(&mut self, id: &str) -> bool {
        let is_active = self.active.as_deref() == Some(id);
        let Some(track) = self.find_mut(id) else {
            return false;
        };
        track.seal();
        if is_active && track.pending() == 0 {
            track.set_state(TrackState::Completed);
            self.active = None;
            self.activate_next();
            self.evict();
        }
        true
    }

    /// Stop the active track at its current position and flush the rest
    pub fn interrupt(&mut self) -> Option<InterruptionMarker> {
        let track = self.active_mut()?;
        if track.state() != TrackState::Active {
            return None;
        }

        let marker = InterruptionMarker {
            track_id: track.id().to_string(),
            sample_offset: track.position(),
            wall_clock_time: Utc::now(),
        };
        let flushed = track.flush();
        track.set_state(TrackState::Interrupted);
        tracing::info!(
            "Interrupted track {} at sample {} ({} unplayed samples flushed)",
            marker.track_id,
            marker.sample_offset,
            flushed
        );

        if self.interrupted.len() == INTERRUPTED_HISTORY {
            self.interrupted.pop_front();
        }
        self.interrupted.push_back(marker.track_id.clone());

        self.active = None;
        self.stats.interrupted += 1;
        self.activate_next();
        self.evict();
        Some(marker)
    }

    /// Progress of the active track without changing anything
    pub fn active_offset(&self) -> Option<TrackOffset> {
        let id = self.active.as_deref()?;
        self.track_offset(id)
    }

    /// Progress of any retained track
    pub fn track_offset(&self, id: &str) -> Option<TrackOffset> {
        self.find(id).map(|t| TrackOffset {
            track_id: t.id().to_string(),
            offset: t.position(),
            enqueued: t.enqueued(),
        })
    }

    pub fn track_state(&self, id: &str) -> Option<TrackState> {
        self.find(id).map(|t| t.state())
    }

    /// Samples queued across all tracks
    pub fn queued_samples(&self) -> usize {
        self.tracks.iter().map(|t| t.pending()).sum()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Whether the timeline for `id` is still held
    pub fn has_track(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.interrupted.clear();
        self.active = None;
    }

    /// Drop the oldest unplayed fragments until the queue fits again
    fn enforce_overrun(&mut self) {
        let mut queued = self.queued_samples();
        if queued <= self.max_queued {
            return;
        }

        let mut skipped = 0usize;
        for track in self.tracks.iter_mut() {
            while queued > self.max_queued && track.pending() > 0 {
                let n = track.drop_oldest();
                queued -= n;
                skipped += n;
            }
            if queued <= self.max_queued {
                break;
            }
        }

        self.stats.dropped += skipped as u64;
        tracing::warn!("Playback overrun: dropped {} unplayed samples", skipped);
    }

    fn evict(&mut self) {
        let finished = self.tracks.iter().filter(|t| t.state().is_finished()).count();
        let mut excess = finished.saturating_sub(self.retained);
        while excess > 0 {
            match self.tracks.iter().position(|t| t.state().is_finished()) {
                Some(idx) => {
                    self.tracks.remove(idx);
                    excess -= 1;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager() -> TrackManager {
        TrackManager::new(usize::MAX, 4)
    }

    fn pull(manager: &mut TrackManager, n: usize) -> Vec<i16> {
        let mut out = vec![0i16; n];
        manager.render(&mut out);
        out
    }

    #[test]
    fn test_interrupt_with_nothing_playing() {
        let mut manager = manager();
        assert!(manager.interrupt().is_none());
        assert!(manager.active_offset().is_none());
        assert_eq!(manager.stats().interrupted, 0);
    }

    #[test]
    fn test_cumulative_offset_after_deltas() {
        let mut manager = manager();
        for len in [10, 20, 15] {
            manager.enqueue(PlaybackFragment::new("t1", vec![1; len]));
        }

        let offset = manager.active_offset().unwrap();
        assert_eq!(offset.track_id, "t1");
        assert_eq!(offset.enqueued, 45);
        assert_eq!(offset.offset, 0);

        pull(&mut manager, 12);
        let later = manager.active_offset().unwrap();
        assert_eq!(later.offset, 12);
        assert!(later.offset <= later.enqueued);
    }

    #[test]
    fn test_interrupt_cuts_at_played_sample() {
        let mut manager = manager();
        for len in [10, 20, 15] {
            manager.enqueue(PlaybackFragment::new("t1", vec![7; len]));
        }
        pull(&mut manager, 30);

        let marker = manager.interrupt().unwrap();
        assert_eq!(marker.track_id, "t1");
        assert_eq!(marker.sample_offset, 30);
        assert_eq!(manager.track_state("t1"), Some(TrackState::Interrupted));

        // Late fragments for the interrupted track never reach the device
        let outcome = manager.enqueue(PlaybackFragment::new("t1", vec![7; 50]));
        assert_eq!(outcome, EnqueueOutcome::Rejected(TrackState::Interrupted));
        assert!(pull(&mut manager, 64).iter().all(|&s| s == 0));
        assert!(manager.interrupt().is_none());
    }

    #[test]
    fn test_next_track_waits_for_previous() {
        let mut manager = manager();
        manager.enqueue(PlaybackFragment::new("a", vec![1; 4]));
        manager.enqueue(PlaybackFragment::new("b", vec![2; 4]));
        assert_eq!(manager.track_state("b"), Some(TrackState::Pending));

        let out = pull(&mut manager, 6);
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2]);
        assert_eq!(manager.track_state("a"), Some(TrackState::Completed));
        assert_eq!(manager.active_offset().unwrap().track_id, "b");
    }

    #[test]
    fn test_underrun_is_silence_and_keeps_track_active() {
        let mut manager = manager();
        manager.enqueue(PlaybackFragment::new("a", vec![3; 2]));
        let out = pull(&mut manager, 4);
        assert_eq!(out, vec![3, 3, 0, 0]);
        assert_eq!(manager.stats().underrun, 2);

        manager.enqueue(PlaybackFragment::new("a", vec![4; 2]));
        assert_eq!(pull(&mut manager, 2), vec![4, 4]);
        assert_eq!(manager.active_offset().unwrap().offset, 4);
    }

    #[test]
    fn test_finished_track_completes_when_drained() {
        let mut manager = manager();
        manager.enqueue(PlaybackFragment::new("a", vec![3; 2]));
        assert!(manager.finish_track("a"));
        pull(&mut manager, 4);
        assert_eq!(manager.track_state("a"), Some(TrackState::Completed));
        assert!(manager.interrupt().is_none());
        assert!(!manager.finish_track("missing"));
    }

    #[test]
    fn test_overrun_drops_oldest_fragments() {
        let mut manager = TrackManager::new(10, 4);
        manager.enqueue(PlaybackFragment::new("a", vec![1; 6]));
        manager.enqueue(PlaybackFragment::new("a", vec![2; 6]));

        assert_eq!(manager.queued_samples(), 6);
        assert_eq!(manager.stats().dropped, 6);
        assert_eq!(pull(&mut manager, 6), vec![2; 6]);
        assert_eq!(manager.active_offset().unwrap().offset, 12);
    }

    #[test]
    fn test_finished_tracks_are_evicted() {
        let mut manager = TrackManager::new(usize::MAX, 1);
        for id in ["a", "b", "c"] {
            manager.enqueue(PlaybackFragment::new(id, vec![1; 2]));
        }
        pull(&mut manager, 6);

        assert!(manager.track_offset("a").is_none());
        assert_eq!(manager.track_state("b"), Some(TrackState::Completed));
        assert_eq!(manager.active_offset().unwrap().track_id, "c");
    }

    #[test]
    fn test_interrupted_track_stays_silent_after_eviction() {
        // Nothing retained: the timeline is evicted at the interrupt itself
        let mut manager = TrackManager::new(usize::MAX, 0);
        manager.enqueue(PlaybackFragment::new("t1", vec![9; 45]));
        pull(&mut manager, 30);
        assert_eq!(manager.interrupt().unwrap().sample_offset, 30);
        assert!(!manager.has_track("t1"));

        let outcome = manager.enqueue(PlaybackFragment::new("t1", vec![9; 10]));
        assert_eq!(outcome, EnqueueOutcome::Rejected(TrackState::Interrupted));
        assert!(pull(&mut manager, 10).iter().all(|&s| s == 0));

        // Default retention, pushed out by later interrupted tracks
        let mut manager = TrackManager::new(usize::MAX, 8);
        manager.enqueue(PlaybackFragment::new("t1", vec![9; 45]));
        pull(&mut manager, 30);
        manager.interrupt().unwrap();
        for n in 0..8 {
            let id = format!("later-{}", n);
            manager.enqueue(PlaybackFragment::new(id, vec![1; 4]));
            pull(&mut manager, 2);
            manager.interrupt().unwrap();
        }
        assert!(!manager.has_track("t1"));

        let outcome = manager.enqueue(PlaybackFragment::new("t1", vec![9; 10]));
        assert_eq!(outcome, EnqueueOutcome::Rejected(TrackState::Interrupted));
        assert!(pull(&mut manager, 10).iter().all(|&s| s == 0));
        assert!(manager.active_offset().is_none());
    }

    #[test]
    fn test_render_feeds_tap() {
        let tap = SampleTap::new(16, 24_000);
        tap.connect(24_000);
        let mut manager = manager();
        manager.set_tap(Some(tap.clone()));
        manager.enqueue(PlaybackFragment::new("a", vec![i16::MAX; 4]));
        pull(&mut manager, 4);

        let snap = tap.snapshot(4).unwrap();
        assert!(snap.iter().all(|&s| s > 0.99));
    }

    proptest! {
        #[test]
        fn prop_single_track_plays_in_enqueue_order(
            fragments in proptest::collection::vec(
                proptest::collection::vec(any::<i16>(), 0..64), 0..16),
            pull_size in 1usize..50,
        ) {
            let mut manager = manager();
            let mut expected = Vec::new();
            for fragment in &fragments {
                expected.extend_from_slice(fragment);
                manager.enqueue(PlaybackFragment::new("t", fragment.clone()));
            }

            let mut played = Vec::new();
            while played.len() < expected.len() {
                let mut out = vec![0i16; pull_size];
                let n = manager.render(&mut out);
                prop_assert!(n > 0);
                played.extend_from_slice(&out[..n]);
            }
            prop_assert_eq!(played, expected);
        }
    }
}
