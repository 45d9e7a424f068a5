//! Audio playback of assistant tracks to the output device
//!
//! The output callback pulls mono PCM16 from the shared [`TrackManager`] and
//! fans it out to every device channel. Interrupt latency is therefore one
//! device buffer at most.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{i16_to_f32, LinearResampler, SampleTap};
use crate::audio::device::{find_cpal_device, stream_settings, DeviceKind};
use crate::config::PlaybackConfig;
use crate::error::AudioError;
use crate::tracks::{
    EnqueueOutcome, InterruptionMarker, PlaybackFragment, PlaybackStats, SharedTrackManager,
    TrackManager, TrackOffset,
};

/// Stream parameters requested from an output sink
#[derive(Debug, Clone)]
pub struct OutputRequest {
    pub sample_rate: u32,
    pub buffer_size: Option<u32>,
}

/// Platform side of playback: opens a device that pulls from the tracks
pub trait OutputSink: Send + Sync {
    fn open(
        &self,
        request: &OutputRequest,
        tracks: SharedTrackManager,
    ) -> Result<Box<dyn OutputStream>, AudioError>;
}

/// An open output device
pub trait OutputStream: Send {
    fn check_errors(&self) -> Option<AudioError>;
    fn close(&mut self);
}

/// Output sink backed by the default cpal output device
#[derive(Debug, Default, Clone)]
pub struct CpalOutput {
    pub device_id: Option<String>,
}

impl OutputSink for CpalOutput {
    fn open(
        &self,
        request: &OutputRequest,
        tracks: SharedTrackManager,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        let device = find_cpal_device(DeviceKind::Output, self.device_id.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let settings = stream_settings(&device, DeviceKind::Output, request.sample_rate)?;
        let wire_rate = request.sample_rate;

        let config = StreamConfig {
            channels: settings.channels,
            sample_rate: cpal::SampleRate(settings.sample_rate),
            buffer_size: match request.buffer_size {
                Some(size) => cpal::BufferSize::Fixed(size),
                None => cpal::BufferSize::Default,
            },
        };
        let channels = config.channels.max(1) as usize;

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("playback-output".to_string())
            .spawn(move || {
                let mut adapter = RateAdapter::new(wire_rate, config.sample_rate.0);
                let mut mono: Vec<f32> = Vec::new();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        mono.resize(frames, 0.0);
                        adapter.fill(&mut tracks.lock(), &mut mono);
                        for (frame, &sample) in data.chunks_exact_mut(channels).zip(mono.iter()) {
                            frame.fill(sample);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::DeviceUnavailable("playback thread exited".to_string()));
            }
        }

        tracing::info!("Opened output device {} ({} ch @ {} Hz)", name, channels, settings.sample_rate);

        Ok(Box::new(CpalOutputStream {
            running,
            error_rx,
            thread_handle: Some(handle),
        }))
    }
}

/// Converts wire-rate track audio to the device rate, rendering only as
/// many track samples as each callback consumes so interrupt offsets stay
/// within a sample of what reached the device
struct RateAdapter {
    resampler: LinearResampler,
    wire: Vec<i16>,
    scratch: Vec<f32>,
    ready: VecDeque<f32>,
}

impl RateAdapter {
    fn new(wire_rate: u32, device_rate: u32) -> Self {
        Self {
            resampler: LinearResampler::new(wire_rate, device_rate),
            wire: Vec::new(),
            scratch: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    fn fill(&mut self, tracks: &mut TrackManager, out: &mut [f32]) {
        while self.ready.len() < out.len() {
            let needed = self.resampler.input_needed(out.len() - self.ready.len()).max(1);
            self.wire.resize(needed, 0);
            tracks.render(&mut self.wire);
            self.scratch.clear();
            self.scratch.extend(self.wire.iter().map(|&s| i16_to_f32(s)));
            self.resampler.process(&self.scratch, &mut self.ready);
        }
        let len = out.len();
        for (slot, sample) in out.iter_mut().zip(self.ready.drain(..len)) {
            *slot = sample;
        }
    }
}

struct CpalOutputStream {
    running: Arc<AtomicBool>,
    error_rx: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
}

impl OutputStream for CpalOutputStream {
    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output sink with no device: samples are pulled explicitly by the caller
///
/// Used for offline rendering and to drive playback deterministically.
#[derive(Clone, Default)]
pub struct HeadlessOutput {
    tracks: Arc<Mutex<Option<SharedTrackManager>>>,
    fail: Arc<AtomicBool>,
}

impl HeadlessOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail as if the device were missing
    pub fn fail_open(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.tracks.lock().is_some()
    }

    /// Render `n` samples as if the device had consumed them
    pub fn pull(&self, n: usize) -> Vec<i16> {
        let mut out = vec![0i16; n];
        if let Some(tracks) = self.tracks.lock().as_ref() {
            tracks.lock().render(&mut out);
        }
        out
    }
}

struct HeadlessStream {
    tracks: Arc<Mutex<Option<SharedTrackManager>>>,
}

impl OutputSink for HeadlessOutput {
    fn open(
        &self,
        _request: &OutputRequest,
        tracks: SharedTrackManager,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("headless output disabled".to_string()));
        }
        *self.tracks.lock() = Some(tracks);
        Ok(Box::new(HeadlessStream {
            tracks: self.tracks.clone(),
        }))
    }
}

impl OutputStream for HeadlessStream {
    fn check_errors(&self) -> Option<AudioError> {
        None
    }

    fn close(&mut self) {
        self.tracks.lock().take();
    }
}

/// Owns the output graph between `connect()` and `disconnect()`
pub struct AudioPlaybackEngine {
    sink: Arc<dyn OutputSink>,
    config: PlaybackConfig,
    tracks: SharedTrackManager,
    tap: Option<SampleTap>,
    stream: Option<Box<dyn OutputStream>>,
}

impl AudioPlaybackEngine {
    pub fn new(sink: Arc<dyn OutputSink>, config: PlaybackConfig, tap: Option<SampleTap>) -> Self {
        let tracks = TrackManager::shared(config.max_queued_samples(), config.retained_tracks);
        Self {
            sink,
            config,
            tracks,
            tap,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the output graph
    pub fn connect(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.tracks.lock().set_tap(self.tap.clone());
        let request = OutputRequest {
            sample_rate: self.config.sample_rate,
            buffer_size: self.config.buffer_size,
        };
        let stream = self.sink.open(&request, self.tracks.clone())?;
        if let Some(tap) = &self.tap {
            tap.connect(self.config.sample_rate);
        }
        self.stream = Some(stream);
        tracing::debug!("Playback connected at {} Hz", self.config.sample_rate);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(AudioError::NotConnected)
        }
    }

    /// Schedule a fragment; `Ok(false)` when its track already finished
    pub fn enqueue(&self, fragment: PlaybackFragment) -> Result<bool, AudioError> {
        self.ensure_connected()?;
        let track_id = fragment.track_id.clone();
        match self.tracks.lock().enqueue(fragment) {
            EnqueueOutcome::Scheduled => Ok(true),
            EnqueueOutcome::Rejected(state) => {
                tracing::debug!("Dropped fragment for {:?} track {}", state, track_id);
                Ok(false)
            }
        }
    }

    /// Cut the active track at the sample currently reaching the device
    pub fn interrupt(&self) -> Result<Option<InterruptionMarker>, AudioError> {
        self.ensure_connected()?;
        Ok(self.tracks.lock().interrupt())
    }

    /// Mark a track fully received
    pub fn finish_track(&self, track_id: &str) -> Result<bool, AudioError> {
        self.ensure_connected()?;
        Ok(self.tracks.lock().finish_track(track_id))
    }

    /// Active track progress, without side effects
    pub fn active_track_offset(&self) -> Result<Option<TrackOffset>, AudioError> {
        self.ensure_connected()?;
        Ok(self.tracks.lock().active_offset())
    }

    pub fn stats(&self) -> PlaybackStats {
        self.tracks.lock().stats()
    }

    /// Whether playback still holds the timeline of `track_id`
    pub fn has_track(&self, track_id: &str) -> bool {
        self.tracks.lock().has_track(track_id)
    }

    /// Next asynchronous device error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.stream.as_ref().and_then(|s| s.check_errors())
    }

    /// Release the output device and forget all tracks; false when it was
    /// not connected
    pub fn disconnect(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        stream.close();
        let mut tracks = self.tracks.lock();
        tracks.clear();
        tracks.set_tap(None);
        drop(tracks);
        if let Some(tap) = &self.tap {
            tap.disconnect();
        }
        tracing::debug!("Playback disconnected");
        true
    }
}

impl Drop for AudioPlaybackEngine {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(output: &HeadlessOutput) -> AudioPlaybackEngine {
        AudioPlaybackEngine::new(Arc::new(output.clone()), PlaybackConfig::default(), None)
    }

    #[test]
    fn test_methods_require_connect() {
        let output = HeadlessOutput::new();
        let engine = engine(&output);
        assert_eq!(
            engine.enqueue(PlaybackFragment::new("t1", vec![1])),
            Err(AudioError::NotConnected)
        );
        assert_eq!(engine.interrupt(), Err(AudioError::NotConnected));
        assert_eq!(engine.active_track_offset(), Err(AudioError::NotConnected));
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let output = HeadlessOutput::new();
        output.fail_open();
        let mut engine = engine(&output);
        assert!(matches!(engine.connect(), Err(AudioError::DeviceUnavailable(_))));
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_barge_in_round_trip() {
        let output = HeadlessOutput::new();
        let mut engine = engine(&output);
        engine.connect().unwrap();

        for len in [10, 20, 15] {
            assert!(engine.enqueue(PlaybackFragment::new("t1", vec![100; len])).unwrap());
        }
        assert_eq!(engine.active_track_offset().unwrap().unwrap().enqueued, 45);

        output.pull(30);
        let marker = engine.interrupt().unwrap().unwrap();
        assert_eq!(marker.sample_offset, 30);

        assert!(!engine.enqueue(PlaybackFragment::new("t1", vec![100; 5])).unwrap());
        assert!(output.pull(20).iter().all(|&s| s == 0));
        assert_eq!(engine.interrupt().unwrap(), None);
    }

    #[test]
    fn test_device_rate_conversion_tracks_heard_offset() {
        let mut tracks = TrackManager::new(usize::MAX, 4);
        tracks.enqueue(PlaybackFragment::new("t1", vec![i16::MAX; 40]));

        // 48 kHz device, 24 kHz track audio: 20 frames consume 10 samples
        let mut adapter = RateAdapter::new(24_000, 48_000);
        let mut out = vec![0.0f32; 20];
        adapter.fill(&mut tracks, &mut out);
        assert_eq!(tracks.active_offset().unwrap().offset, 10);
        assert!(out[2..].iter().all(|&s| s > 0.99));

        adapter.fill(&mut tracks, &mut out);
        assert_eq!(tracks.interrupt().unwrap().sample_offset, 20);

        // Downsampling device pulls faster than it plays
        let mut tracks = TrackManager::new(usize::MAX, 4);
        tracks.enqueue(PlaybackFragment::new("t2", vec![1; 100]));
        let mut adapter = RateAdapter::new(24_000, 16_000);
        let mut out = vec![0.0f32; 16];
        adapter.fill(&mut tracks, &mut out);
        let offset = tracks.active_offset().unwrap().offset;
        assert!((23..=25).contains(&offset), "offset {}", offset);
    }

    #[test]
    fn test_disconnect_releases_output() {
        let output = HeadlessOutput::new();
        let mut engine = engine(&output);
        engine.connect().unwrap();
        assert!(output.is_open());
        engine.enqueue(PlaybackFragment::new("t1", vec![1; 8])).unwrap();

        assert!(engine.disconnect());
        assert!(!output.is_open());
        assert!(!engine.disconnect());
        assert_eq!(engine.interrupt(), Err(AudioError::NotConnected));
    }
}
