//! Audio subsystem module

pub mod analyzer;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use analyzer::{AmplitudeFrame, AnalyzerSource, Band, FrequencyAnalyzer};
pub use buffer::{CaptureChunk, RingBuffer, SampleTap};
pub use capture::{AudioCaptureEngine, CaptureState, ChunkHandler, CpalInput, InputSource};
pub use device::{AudioDevice, CpalInventory, DeviceKind, DeviceRegistry, DeviceWatch};
pub use playback::{AudioPlaybackEngine, CpalOutput, HeadlessOutput, OutputSink};
