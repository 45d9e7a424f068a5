//! Audio capture from the selected input device
//!
//! The device stream runs on its own thread and pushes raw frames into a
//! lock-free ring buffer. A single pump thread drains the ring, assembles
//! fixed-size PCM16 chunks and hands them to the chunk handler one at a time.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{
    create_shared_buffer, AudioFrame, CaptureChunk, ChunkAssembler, SampleTap, SharedRingBuffer,
};
use crate::audio::device::{find_cpal_device, stream_settings, DeviceKind};
use crate::config::AudioConfig;
use crate::constants::RING_BUFFER_CAPACITY;
use crate::error::AudioError;

/// Callback receiving captured chunks, never invoked concurrently
pub type ChunkHandler = Arc<dyn Fn(CaptureChunk) + Send + Sync>;

/// Stream parameters requested from an input source
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub sample_rate: u32,
    pub buffer_size: Option<u32>,
}

/// Platform side of capture: opens a device and feeds frames into a ring
pub trait InputSource: Send + Sync {
    fn open(
        &self,
        device_id: Option<&str>,
        request: &InputRequest,
        sink: SharedRingBuffer,
    ) -> Result<Box<dyn InputStream>, AudioError>;
}

/// An open input device; dropping or closing it releases the device
pub trait InputStream: Send {
    fn device_id(&self) -> &str;
    /// Rate the device actually runs at
    fn sample_rate(&self) -> u32;
    /// Gate frame delivery without releasing the device
    fn set_active(&mut self, active: bool);
    /// Next asynchronous stream error, if any
    fn check_errors(&self) -> Option<AudioError>;
    fn close(&mut self);
}

/// Input source backed by cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl InputSource for CpalInput {
    fn open(
        &self,
        device_id: Option<&str>,
        request: &InputRequest,
        sink: SharedRingBuffer,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        let device = find_cpal_device(DeviceKind::Input, device_id)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let settings = stream_settings(&device, DeviceKind::Input, request.sample_rate)?;

        let config = StreamConfig {
            channels: settings.channels,
            sample_rate: cpal::SampleRate(settings.sample_rate),
            buffer_size: match request.buffer_size {
                Some(size) => cpal::BufferSize::Fixed(size),
                None => cpal::BufferSize::Default,
            },
        };
        let channels = config.channels;

        let running = Arc::new(AtomicBool::new(true));
        let active = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_loop = running.clone();
        let active_for_callback = active.clone();
        let start_time = Instant::now();

        // cpal streams are not Send; the stream lives and dies on this thread
        let handle = thread::Builder::new()
            .name("capture-input".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !active_for_callback.load(Ordering::Relaxed) {
                            return;
                        }
                        let timestamp = start_time.elapsed().as_micros() as u64;
                        // Push may fail on overflow; the pump is behind
                        let _ = sink.push(AudioFrame::new(data.to_vec(), channels, timestamp));
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
                // Stream is dropped here, releasing the device
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
                return Err(AudioError::DeviceUnavailable("capture thread exited".to_string()));
            }
        }

        tracing::info!("Opened input device {} ({} ch @ {} Hz)", name, channels, settings.sample_rate);

        Ok(Box::new(CpalInputStream {
            device_id: format!("input:{}", name),
            sample_rate: settings.sample_rate,
            running,
            active,
            error_rx,
            thread_handle: Some(handle),
        }))
    }
}

struct CpalInputStream {
    device_id: String,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    error_rx: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_active(&mut self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capture engine lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Uninitialized,
    Bound(String),
    Recording(String),
    Paused(String),
    Ended,
}

struct Pump {
    running: Arc<AtomicBool>,
    handle: JoinHandle<ChunkAssembler>,
}

/// Owns the input device between `begin()` and `end()`
pub struct AudioCaptureEngine {
    source: Arc<dyn InputSource>,
    config: AudioConfig,
    ring: SharedRingBuffer,
    tap: Option<SampleTap>,
    stream: Option<Box<dyn InputStream>>,
    assembler: Option<ChunkAssembler>,
    handler: Option<ChunkHandler>,
    pump: Option<Pump>,
    state: CaptureState,
}

impl AudioCaptureEngine {
    pub fn new(source: Arc<dyn InputSource>, config: AudioConfig, tap: Option<SampleTap>) -> Self {
        Self {
            source,
            config,
            ring: create_shared_buffer(RING_BUFFER_CAPACITY),
            tap,
            stream: None,
            assembler: None,
            handler: None,
            pump: None,
            state: CaptureState::Uninitialized,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, CaptureState::Recording(_))
    }

    /// Open the device (or the platform default) and reset the chunk sequence
    pub fn begin(&mut self, device_id: Option<&str>) -> Result<String, AudioError> {
        if self.state == CaptureState::Ended {
            return Err(AudioError::EngineEnded);
        }
        if self.stream.is_some() {
            tracing::debug!("Rebinding capture device");
            self.release();
        }

        self.ring.clear();
        let request = InputRequest {
            sample_rate: self.config.sample_rate,
            buffer_size: self.config.buffer_size,
        };
        let stream = self.source.open(device_id, &request, self.ring.clone())?;
        let bound = stream.device_id().to_string();

        // Chunks leave the pump at the configured rate whatever the device runs at
        self.assembler = Some(ChunkAssembler::new(
            self.config.chunk_samples,
            stream.sample_rate(),
            self.config.sample_rate,
        ));
        if let Some(tap) = &self.tap {
            tap.connect(self.config.sample_rate);
        }
        self.stream = Some(stream);
        self.handler = None;
        self.state = CaptureState::Bound(bound.clone());

        tracing::info!(
            "Capture bound to {} ({} samples/chunk, {:.0}ms)",
            bound,
            self.config.chunk_samples,
            self.config.chunk_duration_ms()
        );
        Ok(bound)
    }

    /// Start (or resume) chunk delivery
    ///
    /// When paused, delivery resumes to the handler registered first and the
    /// new one is ignored.
    pub fn record(&mut self, handler: ChunkHandler) -> Result<(), AudioError> {
        let device = match &self.state {
            CaptureState::Ended => return Err(AudioError::EngineEnded),
            CaptureState::Uninitialized => return Err(AudioError::NotBound),
            CaptureState::Recording(_) => return Ok(()),
            CaptureState::Bound(device) | CaptureState::Paused(device) => device.clone(),
        };

        let handler = self.handler.get_or_insert(handler).clone();
        let Some(mut assembler) = self.assembler.take() else {
            return Err(AudioError::NotBound);
        };
        let stream = self.stream.as_mut().ok_or(AudioError::NotBound)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_for_pump = running.clone();
        let ring = self.ring.clone();
        let tap = self.tap.clone();

        let handle = thread::Builder::new()
            .name("capture-pump".to_string())
            .spawn(move || {
                loop {
                    let keep_going = running_for_pump.load(Ordering::Acquire);
                    while let Some(frame) = ring.try_pop() {
                        for chunk in assembler.push(&frame) {
                            if let Some(tap) = &tap {
                                tap.write(&chunk.mono);
                            }
                            handler(chunk);
                        }
                    }
                    // Drain once more after stop so nothing captured before
                    // the pause is lost
                    if !keep_going {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                assembler
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream.set_active(true);
        self.pump = Some(Pump { running, handle });
        self.state = CaptureState::Recording(device);
        tracing::debug!("Capture recording");
        Ok(())
    }

    /// Stop delivery but keep the device; false (with a warning) when not
    /// recording
    pub fn pause(&mut self) -> bool {
        let CaptureState::Recording(device) = &self.state else {
            tracing::warn!("Capture pause ignored: not recording ({:?})", self.state);
            return false;
        };
        let device = device.clone();

        if let Some(stream) = self.stream.as_mut() {
            stream.set_active(false);
        }
        self.stop_pump();
        self.state = CaptureState::Paused(device);
        tracing::debug!("Capture paused");
        true
    }

    /// Release the device; false when already ended
    pub fn end(&mut self) -> bool {
        if self.state == CaptureState::Ended {
            return false;
        }
        self.release();
        self.state = CaptureState::Ended;
        tracing::info!("Capture ended");
        true
    }

    /// Next asynchronous device error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.stream.as_ref().and_then(|s| s.check_errors())
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.running.store(false, Ordering::Release);
            match pump.handle.join() {
                Ok(assembler) => self.assembler = Some(assembler),
                Err(_) => tracing::error!("Capture pump panicked"),
            }
        }
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.set_active(false);
        }
        self.stop_pump();
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.ring.clear();
        self.assembler = None;
        self.handler = None;
        if let Some(tap) = &self.tap {
            tap.disconnect();
        }
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        if self.state != CaptureState::Ended {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestInput;
    use std::sync::mpsc;

    fn engine(input: &TestInput) -> AudioCaptureEngine {
        let config = AudioConfig {
            sample_rate: 16_000,
            chunk_samples: 4,
            buffer_size: None,
        };
        AudioCaptureEngine::new(Arc::new(input.clone()), config, None)
    }

    fn collector() -> (ChunkHandler, mpsc::Receiver<CaptureChunk>) {
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let handler: ChunkHandler = Arc::new(move |chunk| {
            let _ = tx.lock().send(chunk);
        });
        (handler, rx)
    }

    fn recv(rx: &mpsc::Receiver<CaptureChunk>) -> CaptureChunk {
        rx.recv_timeout(Duration::from_secs(2)).expect("chunk")
    }

    #[test]
    fn test_record_before_begin_fails() {
        let input = TestInput::default();
        let mut engine = engine(&input);
        let (handler, _rx) = collector();
        assert_eq!(engine.record(handler), Err(AudioError::NotBound));
        assert!(!engine.pause());
    }

    #[test]
    fn test_unavailable_device() {
        let input = TestInput::default();
        input.fail_open();
        let mut engine = engine(&input);
        assert!(matches!(engine.begin(None), Err(AudioError::DeviceUnavailable(_))));
        assert_eq!(engine.state(), &CaptureState::Uninitialized);
    }

    #[test]
    fn test_chunks_are_delivered_in_sequence() {
        let input = TestInput::default();
        let mut engine = engine(&input);
        engine.begin(Some("input:test")).unwrap();
        let (handler, rx) = collector();
        engine.record(handler.clone()).unwrap();
        // Second record is a no-op success
        engine.record(handler).unwrap();

        input.push(vec![0.25; 10]);
        let first = recv(&rx);
        let second = recv(&rx);
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.mono.len(), 4);
        assert!(engine.end());
    }

    #[test]
    fn test_chunks_use_configured_rate_when_device_differs() {
        let input = TestInput::default();
        input.set_device_rate(32_000);
        let mut engine = engine(&input);
        engine.begin(None).unwrap();
        let (handler, rx) = collector();
        engine.record(handler).unwrap();

        // 16 samples at 32 kHz are 8 at 16 kHz: two chunks of four
        input.push(vec![0.25; 16]);
        assert_eq!(recv(&rx).sequence, 0);
        let second = recv(&rx);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.mono.len(), 4);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(input.opens(), 1);
    }

    #[test]
    fn test_pause_keeps_device_and_resumes_with_same_handler() {
        let input = TestInput::default();
        let mut engine = engine(&input);
        engine.begin(None).unwrap();
        let (handler, rx) = collector();
        engine.record(handler).unwrap();

        assert!(engine.pause());
        assert!(!engine.pause());
        assert!(matches!(engine.state(), CaptureState::Paused(_)));
        assert!(input.is_open());

        // Frames while paused are gated at the device
        input.push(vec![0.5; 8]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let (other, other_rx) = collector();
        engine.record(other).unwrap();
        input.push(vec![0.5; 4]);
        assert_eq!(recv(&rx).sequence, 0);
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_sequence_resets_on_new_begin() {
        let input = TestInput::default();
        let mut engine = engine(&input);
        engine.begin(None).unwrap();
        let (handler, rx) = collector();
        engine.record(handler).unwrap();
        input.push(vec![0.1; 8]);
        assert_eq!(recv(&rx).sequence, 0);
        assert_eq!(recv(&rx).sequence, 1);

        engine.begin(None).unwrap();
        let (handler, rx) = collector();
        engine.record(handler).unwrap();
        input.push(vec![0.1; 4]);
        assert_eq!(recv(&rx).sequence, 0);
    }

    #[test]
    fn test_calls_after_end_fail() {
        let input = TestInput::default();
        let mut engine = engine(&input);
        engine.begin(None).unwrap();
        assert!(engine.end());
        assert!(!input.is_open());
        assert!(!engine.end());
        assert_eq!(engine.begin(None), Err(AudioError::EngineEnded));
        let (handler, _rx) = collector();
        assert_eq!(engine.record(handler), Err(AudioError::EngineEnded));
        assert!(!engine.pause());
    }
}
