//! Lock-free ring buffer, PCM16 helpers and chunk assembly
//!
//! The device callback pushes raw interleaved frames into a single-producer
//! single-consumer ring buffer; the capture pump drains it and assembles
//! fixed-size mono PCM16 chunks.

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Audio frame as delivered by one device callback
#[derive(Clone)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in microseconds since the stream started
    pub timestamp: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, timestamp: u64) -> Self {
        Self {
            samples,
            channels,
            timestamp,
        }
    }
}

/// Lock-free ring buffer for audio frames
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame into the buffer
    /// Returns false if buffer is full (overflow)
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a frame, None when empty
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Discard everything currently buffered
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get overflow count
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Convert a float sample in [-1, 1] to PCM16
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert a PCM16 sample to float in [-1, 1]
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Serialize PCM16 samples as little-endian bytes
pub fn pcm16_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        buf.put_i16_le(s);
    }
    buf.freeze()
}

/// Parse little-endian PCM16 bytes; None if the length is odd
pub fn bytes_to_pcm16(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

/// One fixed-size unit of captured microphone audio
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureChunk {
    /// Strictly increasing within one `begin()`
    pub sequence: u64,
    /// Downmixed mono PCM16 at the wire rate, exactly `chunk_samples` long
    pub mono: Vec<i16>,
}

impl CaptureChunk {
    /// Mono samples as little-endian bytes, the wire form for upload
    pub fn to_bytes(&self) -> Bytes {
        pcm16_to_bytes(&self.mono)
    }
}

/// Streaming linear-interpolation rate converter for mono audio
///
/// State carries across calls so block boundaries are seamless. Equal
/// rates pass samples through untouched.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from: u32,
    to: u32,
    step: f64,
    /// Read position; 0 is `prev`, k is the k-th sample of the next block
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    pub fn new(from: u32, to: u32) -> Self {
        let from = from.max(1);
        let to = to.max(1);
        Self {
            from,
            to,
            step: from as f64 / to as f64,
            pos: 0.0,
            prev: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    /// Convert one block, appending the output samples to `out`
    pub fn process<E: Extend<f32>>(&mut self, input: &[f32], out: &mut E) {
        if self.is_passthrough() {
            out.extend(input.iter().copied());
            return;
        }
        if input.is_empty() {
            return;
        }

        let n = input.len();
        let at = |i: usize| if i == 0 { self.prev } else { input[i - 1] };
        let mut produced = Vec::with_capacity((n as f64 / self.step) as usize + 1);
        let mut pos = self.pos;
        while (pos as usize) < n {
            let i = pos as usize;
            let frac = (pos - i as f64) as f32;
            let a = at(i);
            let b = at(i + 1);
            produced.push(a + (b - a) * frac);
            pos += self.step;
        }
        out.extend(produced);

        self.pos = pos - n as f64;
        self.prev = input[n - 1];
    }

    /// Input samples the next `process` call needs to yield at least
    /// `outputs` samples
    pub fn input_needed(&self, outputs: usize) -> usize {
        if outputs == 0 {
            return 0;
        }
        if self.is_passthrough() {
            return outputs;
        }
        (self.pos + (outputs - 1) as f64 * self.step).floor() as usize + 1
    }
}

/// Accumulates device frames into fixed-size mono chunks at the wire rate
pub struct ChunkAssembler {
    chunk_samples: usize,
    resampler: LinearResampler,
    downmixed: Vec<f32>,
    converted: Vec<f32>,
    mono: Vec<i16>,
    next_sequence: u64,
}

impl ChunkAssembler {
    pub fn new(chunk_samples: usize, device_rate: u32, wire_rate: u32) -> Self {
        Self {
            chunk_samples,
            resampler: LinearResampler::new(device_rate, wire_rate),
            downmixed: Vec::new(),
            converted: Vec::new(),
            mono: Vec::with_capacity(chunk_samples),
            next_sequence: 0,
        }
    }

    /// Feed one frame, returning every chunk it completes
    pub fn push(&mut self, frame: &AudioFrame) -> Vec<CaptureChunk> {
        let channels = frame.channels.max(1) as usize;
        self.downmixed.clear();
        self.downmixed.extend(
            frame
                .samples
                .chunks_exact(channels)
                .map(|group| group.iter().sum::<f32>() / channels as f32),
        );
        self.converted.clear();
        self.resampler.process(&self.downmixed, &mut self.converted);

        let mut ready = Vec::new();
        for i in 0..self.converted.len() {
            self.mono.push(f32_to_i16(self.converted[i]));
            if self.mono.len() == self.chunk_samples {
                ready.push(self.emit());
            }
        }
        ready
    }

    fn emit(&mut self) -> CaptureChunk {
        let chunk = CaptureChunk {
            sequence: self.next_sequence,
            mono: std::mem::replace(&mut self.mono, Vec::with_capacity(self.chunk_samples)),
        };
        self.next_sequence += 1;
        chunk
    }

    /// Samples waiting for the next chunk
    pub fn pending(&self) -> usize {
        self.mono.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

struct TapInner {
    samples: VecDeque<f32>,
    capacity: usize,
    sample_rate: u32,
    connected: bool,
}

/// Side tap holding the most recent samples of a graph for analysis
///
/// Writers are the capture pump and the playback render path; the analyzer
/// only reads snapshots. Never on the primary audio path.
#[derive(Clone)]
pub struct SampleTap {
    inner: Arc<Mutex<TapInner>>,
}

impl SampleTap {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TapInner {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                sample_rate,
                connected: false,
            })),
        }
    }

    /// Mark the source graph live at the given rate
    pub fn connect(&self, sample_rate: u32) {
        let mut inner = self.inner.lock();
        inner.sample_rate = sample_rate;
        inner.connected = true;
    }

    /// Mark the source graph gone and forget its audio
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.samples.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().sample_rate
    }

    /// Append PCM16 samples, keeping only the newest `capacity`
    pub fn write(&self, samples: &[i16]) {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return;
        }
        let capacity = inner.capacity;
        let skip = samples.len().saturating_sub(capacity);
        for &s in &samples[skip..] {
            if inner.samples.len() == capacity {
                inner.samples.pop_front();
            }
            inner.samples.push_back(i16_to_f32(s));
        }
    }

    /// Newest `len` samples, zero-padded at the front; None when disconnected
    pub fn snapshot(&self, len: usize) -> Option<Vec<f32>> {
        let inner = self.inner.lock();
        if !inner.connected {
            return None;
        }
        let available = inner.samples.len().min(len);
        let mut out = vec![0.0; len - available];
        out.extend(inner.samples.iter().skip(inner.samples.len() - available));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let buffer = RingBuffer::new(2);

        assert!(buffer.push(AudioFrame::new(vec![0.0; 4], 2, 0)));
        assert!(buffer.push(AudioFrame::new(vec![1.0; 4], 2, 10)));
        assert!(!buffer.push(AudioFrame::new(vec![2.0; 4], 2, 20)));
        assert_eq!(buffer.overflow_count(), 1);

        let popped = buffer.try_pop().unwrap();
        assert_eq!(popped.timestamp, 0);
        assert_eq!(buffer.clear(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_assembler_downmixes_and_splits() {
        let mut assembler = ChunkAssembler::new(4, 24_000, 24_000);

        // 3 stereo frames: L=0.5, R=-0.5 downmix to silence
        let first = assembler.push(&AudioFrame::new(vec![0.5, -0.5, 0.5, -0.5, 0.5, -0.5], 2, 0));
        assert!(first.is_empty());
        assert_eq!(assembler.pending(), 3);

        let second = assembler.push(&AudioFrame::new(vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 2, 1));
        assert_eq!(second.len(), 1);
        let chunk = &second[0];
        assert_eq!(chunk.sequence, 0);
        assert_eq!(chunk.mono, vec![0, 0, 0, 32767]);
        assert_eq!(assembler.pending(), 2);
    }

    #[test]
    fn test_assembler_sequence_increases() {
        let mut assembler = ChunkAssembler::new(2, 16_000, 16_000);
        let chunks = assembler.push(&AudioFrame::new(vec![0.1; 7], 1, 0));
        let seqs: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(assembler.next_sequence(), 3);
    }

    #[test]
    fn test_assembler_converts_device_rate() {
        // 48 kHz stereo device feeding a 24 kHz wire
        let mut assembler = ChunkAssembler::new(4, 48_000, 24_000);
        let chunks = assembler.push(&AudioFrame::new(vec![0.5; 32], 2, 0));
        assert_eq!(chunks.len(), 2);
        assert_eq!(assembler.pending(), 0);
        // First output interpolates from silence
        assert_eq!(chunks[0].mono[0], 0);
        assert!(chunks[0].mono[1..].iter().chain(&chunks[1].mono).all(|&s| s == f32_to_i16(0.5)));
    }

    #[test]
    fn test_resampler_keeps_rate_across_blocks() {
        let mut down = LinearResampler::new(48_000, 24_000);
        let mut out = Vec::new();
        for _ in 0..10 {
            down.process(&[0.25; 480], &mut out);
        }
        assert_eq!(out.len(), 2_400);

        let mut up = LinearResampler::new(24_000, 48_000);
        let mut out = Vec::new();
        up.process(&[0.25; 7], &mut out);
        up.process(&[0.25; 13], &mut out);
        assert_eq!(out.len(), 40);
        assert!(out[1..].iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resampler_input_needed() {
        let mut up = LinearResampler::new(24_000, 48_000);
        assert_eq!(up.input_needed(20), 10);
        let mut out = Vec::new();
        up.process(&[0.0; 10], &mut out);
        assert_eq!(out.len(), 20);

        let odd = LinearResampler::new(24_000, 44_100);
        let needed = odd.input_needed(441);
        let mut out = Vec::new();
        odd.clone().process(&vec![0.0; needed], &mut out);
        assert!(out.len() >= 441);

        let same = LinearResampler::new(16_000, 16_000);
        assert!(same.is_passthrough());
        assert_eq!(same.input_needed(7), 7);
    }

    #[test]
    fn test_pcm16_bytes() {
        let bytes = pcm16_to_bytes(&[1, -2, i16::MAX]);
        assert_eq!(&bytes[..], &[1, 0, 0xFE, 0xFF, 0xFF, 0x7F]);
        assert_eq!(bytes_to_pcm16(&bytes).unwrap(), vec![1, -2, i16::MAX]);
        assert!(bytes_to_pcm16(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_tap_keeps_newest_and_respects_connection() {
        let tap = SampleTap::new(3, 24_000);
        tap.write(&[100; 5]);
        assert!(tap.snapshot(3).is_none());

        tap.connect(24_000);
        tap.write(&[0, 0, 0, 32767, 32767]);
        let snap = tap.snapshot(4).unwrap();
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[0], 0.0);
        assert_eq!(snap[3], 1.0);

        tap.disconnect();
        assert!(tap.snapshot(4).is_none());
    }
}
